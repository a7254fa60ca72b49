//! Client configuration.

use std::path::PathBuf;

/// Default authorizer endpoint.
pub const DEFAULT_AUTHORIZER_HOST: &str = "login.icq.com";
/// Default authorizer port.
pub const DEFAULT_AUTHORIZER_PORT: u16 = 5190;

/// Configuration consumed by [`Client`](crate::oscar::client::Client).
///
/// # Example
///
/// ```ignore
/// let cfg = ClientConfig::new(123456, "secret")
///     .authorizer("login.icq.com", 5190)
///     .accept_in_direct(true)
///     .use_out_direct(true);
/// let mut client = Client::new(cfg);
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Account UIN.
    pub uin: u32,
    /// Account password.
    pub password: String,
    /// Authorizer host.
    pub authorizer_host: String,
    /// Authorizer port.
    pub authorizer_port: u16,
    /// Force this BOS port instead of the redirect's.
    pub bos_override_port: Option<u16>,
    /// Open a listening socket for inbound peer connections.
    pub accept_in_direct: bool,
    /// Initiate outbound peer connections for messages.
    pub use_out_direct: bool,
    /// Charset translation map file.
    pub translation_map: Option<PathBuf>,
}

impl ClientConfig {
    /// Configuration with the stock endpoints and direct connections on.
    pub fn new(uin: u32, password: impl Into<String>) -> Self {
        ClientConfig {
            uin,
            password: password.into(),
            authorizer_host: DEFAULT_AUTHORIZER_HOST.into(),
            authorizer_port: DEFAULT_AUTHORIZER_PORT,
            bos_override_port: None,
            accept_in_direct: true,
            use_out_direct: true,
            translation_map: None,
        }
    }

    /// Override the authorizer endpoint.
    pub fn authorizer(mut self, host: impl Into<String>, port: u16) -> Self {
        self.authorizer_host = host.into();
        self.authorizer_port = port;
        self
    }

    /// Force a BOS port regardless of the redirect.
    pub fn bos_override_port(mut self, port: u16) -> Self {
        self.bos_override_port = Some(port);
        self
    }

    /// Accept inbound peer connections.
    pub fn accept_in_direct(mut self, enabled: bool) -> Self {
        self.accept_in_direct = enabled;
        self
    }

    /// Initiate outbound peer connections.
    pub fn use_out_direct(mut self, enabled: bool) -> Self {
        self.use_out_direct = enabled;
        self
    }

    /// Load a charset translation map at startup.
    pub fn translation_map(mut self, path: impl Into<PathBuf>) -> Self {
        self.translation_map = Some(path.into());
        self
    }
}
