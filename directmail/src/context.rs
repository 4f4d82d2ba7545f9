use std::sync::Arc;

use directmail_common::Envelope;
use ulid::Ulid;

use crate::{config::TransportConfig, events::EventEmitter, source::MessageSource};

/// Everything one send operation shares between its destination groups.
///
/// Owned by exactly one send operation; nothing in here outlives it except
/// through background retries in first-attempt completion mode.
pub struct SendContext {
    pub send_id: Ulid,
    pub config: Arc<TransportConfig>,
    pub emitter: Arc<EventEmitter>,
    pub envelope: Envelope,
    pub source: Arc<dyn MessageSource>,
}

impl SendContext {
    #[must_use]
    pub fn new(
        config: Arc<TransportConfig>,
        emitter: Arc<EventEmitter>,
        envelope: Envelope,
        source: Arc<dyn MessageSource>,
    ) -> Self {
        Self {
            send_id: emitter.send_id(),
            config,
            emitter,
            envelope,
            source,
        }
    }
}
