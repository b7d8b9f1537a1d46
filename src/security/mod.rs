//! Security helpers: source sanitization, network target validation and the
//! permission gate. All of it is pure decision logic with no I/O, except the
//! resolver guards in [`network`].

pub mod network;
pub mod permissions;
pub mod sanitize;

pub use network::{validate_network_target, NetworkScheme, SafeDnsResolver};
pub use permissions::{
    authorize, authorize_action, policy_for, security_signature, ActionPolicy, BridgeAction,
    ACTION_POLICIES,
};
pub use sanitize::{sanitize_source, strip_non_ascii};
