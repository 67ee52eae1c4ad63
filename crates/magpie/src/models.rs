//! These models represent the objects passed around by the agent
//!
//! There are several related formats we need to interact with:
//! - openai-style messages/tools, sent to the completion provider
//! - tool server RPC payloads, exchanged with subprocess servers
//! - sampling requests, sent back to us *by* subprocess servers
//!
//! These overlap to varying degrees. We convert each of them into the
//! internal structs at the boundary where they arrive; because of the need
//! for compatibility the internal models are not an exact match to any of
//! the external formats.
pub mod content;
pub mod message;
pub mod role;
pub mod tool;
