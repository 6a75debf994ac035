use crate::utils::error::{Error, Result};

/// Seam between the reconnect machinery and the physical link.
///
/// The core is agnostic to the broker wire protocol: a connector only has
/// to dial an endpoint and report success or failure. Concrete transports
/// plug in here.
pub trait Connector: Send + Sync + 'static {
    fn dial(&self, endpoint: &str) -> Result<()>;
}

/// In-process link used by the binary and the tests. Dialing succeeds for
/// any well-formed endpoint.
#[derive(Debug, Default)]
pub struct LoopbackConnector;

impl Connector for LoopbackConnector {
    fn dial(&self, endpoint: &str) -> Result<()> {
        if endpoint.trim().is_empty() {
            return Err(Error::Connection("empty endpoint".into()));
        }
        Ok(())
    }
}
