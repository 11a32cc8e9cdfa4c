//! Credential validation against the platform

use std::sync::Arc;

use messenger::{ClientFactory, Identity, MessengerClient};
use tracing::debug;

use crate::pool::fingerprint;

/// A credential that passed the identity check, with the connection that
/// checked it so the worker can reuse it.
pub struct Probed {
    pub identity: Identity,
    pub client: Arc<dyn MessengerClient>,
}

/// Validates credentials with a single `get_self_identity` call.
#[derive(Clone)]
pub struct ProbeClient {
    factory: Arc<dyn ClientFactory>,
}

impl ProbeClient {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self { factory }
    }

    pub async fn probe(&self, secret: &str) -> messenger::Result<Probed> {
        let client = self.factory.connect(secret);
        let result = client.get_self_identity().await;
        debug!(
            fingerprint = %fingerprint(secret),
            ok = result.is_ok(),
            "probed credential"
        );
        Ok(Probed {
            identity: result?,
            client,
        })
    }
}
