//! Peer service categories.

use bitcoin::network::constants::ServiceFlags;

/// Services offered or required by a peer.
#[derive(Debug, Copy, Clone, Default)]
pub enum Services {
    /// Full nodes serving the whole chain.
    #[default]
    Chain,
    /// No services required.
    None,
}

impl From<Services> for ServiceFlags {
    fn from(value: Services) -> Self {
        match value {
            Services::Chain => Self::NETWORK,
            Services::None => Self::NONE,
        }
    }
}
