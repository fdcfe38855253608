use crate::ids::{RequestId, UserId};

/// Permissions granted to the caller for one request.
///
/// Computed by the surface that authenticated the caller and handed to the
/// orchestrator; nothing downstream looks identity up on its own.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// The caller is the built-in assistant account and may act on behalf of other users.
    pub assistant_user: bool,
}

/// Identity and capability context threaded through one orchestration run.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub user_id: UserId,
    pub request_id: RequestId,
    pub capabilities: Capabilities,
}

impl RequestContext {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            request_id: RequestId::new(),
            capabilities: Capabilities::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}
