//! Phore network parameters.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetParams {
    pub name: &'static str,
    pub pubkey_hash_addr_id: u8,
    pub script_hash_addr_id: u8,
    pub private_key_id: u8,
    pub hd_private_key_id: [u8; 4],
    pub hd_public_key_id: [u8; 4],
    pub bech32_hrp: &'static str,
}

pub static MAINNET: NetParams = NetParams {
    name: "mainnet",
    pubkey_hash_addr_id: 55,
    script_hash_addr_id: 13,
    private_key_id: 212,
    hd_private_key_id: [0x02, 0x21, 0x31, 0x2b],
    hd_public_key_id: [0x02, 0x2d, 0x25, 0x33],
    bech32_hrp: "ph",
};

pub static TESTNET: NetParams = NetParams {
    name: "testnet",
    pubkey_hash_addr_id: 139,
    script_hash_addr_id: 19,
    private_key_id: 239,
    hd_private_key_id: [0x3a, 0x80, 0x58, 0x37],
    hd_public_key_id: [0x3a, 0x80, 0x61, 0xa0],
    bech32_hrp: "tph",
};

pub static REGTEST: NetParams = NetParams {
    name: "regtest",
    pubkey_hash_addr_id: 139,
    script_hash_addr_id: 19,
    private_key_id: 239,
    hd_private_key_id: [0x3a, 0x80, 0x58, 0x37],
    hd_public_key_id: [0x3a, 0x80, 0x61, 0xa0],
    bech32_hrp: "phrt",
};

impl NetParams {
    pub fn for_testnet(testnet: bool) -> &'static NetParams {
        if testnet {
            &TESTNET
        } else {
            &MAINNET
        }
    }
}
