/**
 * Wire types exchanged between the mount coordinator
 *  and the per-node agents: requests, responses, the
 *  backup target description, and request validation.
 */
pub mod message;
/**
 * Correlated request/reply over the message broker.
 * One durable inbound queue per node, one exclusive
 *  reply queue per client instance.
 */
pub mod rpc;

pub mod prelude {
    pub use crate::message::{
        BackupTarget, JobRef, LedgerKey, MountAction, MountRequest, MountResponse, RequestContext,
        ResponseStatus, TargetKind, TargetStatus, ValidationError,
    };
    pub use crate::rpc::{node_queue, MountHandler, MountTransport, RpcClient, RpcError, RpcServer};
}
