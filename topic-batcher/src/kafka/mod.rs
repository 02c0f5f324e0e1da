pub mod claim_loop;
pub mod context;
pub mod controller;
pub mod flush;
pub mod metrics_consts;
pub mod record;
pub mod router;
pub mod session;
pub mod types;

pub use claim_loop::{ClaimExit, ClaimLoop, ClaimSettings};
pub use controller::{ConsumerGroupController, ControllerSettings, ControllerStatus};
pub use record::Record;
pub use router::{PartitionRouter, RouteOutcome};
pub use session::{ControllerState, GroupClient, KafkaGroupClient, Session, SessionSlot};
pub use types::Partition;
