use core::{fmt::Display, str::FromStr};

use bitcoin::network::Magic;
use bitcoin::BlockHash;

/// Mainnet network magic.
const MAINNET_MAGIC: [u8; 4] = [0xFD, 0xC2, 0xB4, 0xDD];
/// Testnet network magic.
const TESTNET_MAGIC: [u8; 4] = [0xFD, 0xC2, 0xB8, 0xDD];
/// Regtest network magic.
const REGTEST_MAGIC: [u8; 4] = [0xFA, 0xBF, 0xB5, 0xDA];

/// Genesis block hash for `Mainnet`.
const MAINNET_GENESIS_BLOCK: &str =
    "2ed8c9bd26ad84a3ab8b2f9a9f69ae29bd3a9ac69a986ba1c31a916ddffb0b0f";
/// Genesis block hash for `Testnet`.
const TESTNET_GENESIS_BLOCK: &str =
    "4fc9d2d03d2a4257abbd6f6dcfb991a3049f00a5a10757a6ea657a2b1c767b7f";
/// Genesis block hash for `Regtest`.
const REGTEST_GENESIS_BLOCK: &str =
    "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206";

/// The networks a node can join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    /// Wire magic prefixed to every frame on this network.
    pub fn magic(&self) -> Magic {
        match self {
            Network::Mainnet => Magic::from_bytes(MAINNET_MAGIC),
            Network::Testnet => Magic::from_bytes(TESTNET_MAGIC),
            Network::Regtest => Magic::from_bytes(REGTEST_MAGIC),
        }
    }

    /// Default peer-to-peer port.
    pub fn default_port(&self) -> u16 {
        match self {
            Network::Mainnet => 8121,
            Network::Testnet => 18121,
            Network::Regtest => 18221,
        }
    }

    /// Hash of the genesis block. This is where an empty chain starts
    /// downloading from.
    pub fn genesis_hash(&self) -> BlockHash {
        let hash = match self {
            Network::Mainnet => MAINNET_GENESIS_BLOCK,
            Network::Testnet => TESTNET_GENESIS_BLOCK,
            Network::Regtest => REGTEST_GENESIS_BLOCK,
        };
        BlockHash::from_str(hash).expect("valid block hash")
    }
}

impl serde::Serialize for Network {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Network {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        Network::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl FromStr for Network {
    type Err = NetworkParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Self::Mainnet),
            "testnet" => Ok(Self::Testnet),
            "regtest" => Ok(Self::Regtest),
            _ => Err(NetworkParseError::UnknownType),
        }
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet => write!(f, "testnet"),
            Network::Regtest => write!(f, "regtest"),
        }
    }
}

#[derive(Debug)]
pub enum NetworkParseError {
    UnknownType,
}

impl Display for NetworkParseError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            NetworkParseError::UnknownType => write!(f, "unknown network type"),
        }
    }
}

impl std::error::Error for NetworkParseError {}
