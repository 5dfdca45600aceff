pub mod clock;
pub mod dispatch;
pub mod engine;
pub mod ingress;
pub mod metrics;
pub mod otp;
pub mod secrets;
pub mod sequence;

pub use dispatch::{ActionRunner, ShellRunner};
pub use engine::{handle_event, Engine, EngineConfig, ATTEMPT_TIMEOUT};
pub use ingress::{KnockEvent, PacketIngress, RING_CAPACITY};
pub use metrics::{IngressMetrics, IngressSnapshot};
pub use otp::{PortSequence, SEQUENCE_LEN, SLOT_SECONDS};
pub use secrets::{load_secret_file, load_secrets, Secret};
pub use sequence::SequenceSet;
