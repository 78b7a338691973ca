// Re-export compiled gRPC protos.
//
// All `.proto` files live in this crate so the agent (and anything talking to
// it) shares a single Rust type source.

pub mod hostmgr {
    pub mod agent {
        pub mod v1 {
            tonic::include_proto!("hostmgr.agent.v1");
        }
    }
    pub mod control {
        pub mod v1 {
            tonic::include_proto!("hostmgr.control.v1");
        }
    }
}

pub use hostmgr::agent::v1 as agent_v1;
pub use hostmgr::control::v1 as control_v1;
