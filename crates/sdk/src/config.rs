//! Registry configuration with builder pattern.
//!
//! Provides validated configuration for registry clients:
//! - Coordination ensemble connect string
//! - Root path of the service namespace
//! - Session and per-operation timeouts

use std::{fmt, str::FromStr, time::Duration};

use snafu::ensure;

use crate::error::{ConfigSnafu, DiscoveryError, Result};

/// Default root under which service namespaces are created.
pub const DEFAULT_ROOT_PATH: &str = "/lodestar/services";

/// Default coordination session timeout (10 seconds).
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for a single coordination round-trip (5 seconds).
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// One member of a coordination ensemble.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnsembleMember {
    /// Hostname or IP literal.
    pub host: String,
    /// Client port.
    pub port: u16,
}

impl fmt::Display for EnsembleMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Coordination ensemble address list: `host:port[,host:port...][/chroot]`.
///
/// # Example
///
/// ```
/// use lodestar_sdk::ConnectString;
///
/// let connect: ConnectString = "zk1:2181,zk2:2181/prod".parse().unwrap();
/// assert_eq!(connect.members().len(), 2);
/// assert_eq!(connect.chroot(), Some("/prod"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectString {
    members: Vec<EnsembleMember>,
    chroot: Option<String>,
}

impl ConnectString {
    /// Returns the ensemble members in the order given.
    #[must_use]
    pub fn members(&self) -> &[EnsembleMember] {
        &self.members
    }

    /// Returns the chroot suffix, if any.
    #[must_use]
    pub fn chroot(&self) -> Option<&str> {
        self.chroot.as_deref()
    }
}

impl FromStr for ConnectString {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        ensure!(!s.is_empty(), ConfigSnafu { message: "connect string is empty" });

        let (servers, chroot) = match s.find('/') {
            Some(idx) => (&s[..idx], Some(&s[idx..])),
            None => (s, None),
        };

        let chroot = match chroot {
            Some("/") | None => None,
            Some(chroot) => {
                validate_root(chroot)?;
                Some(chroot.to_owned())
            },
        };

        let members = servers.split(',').map(parse_member).collect::<Result<Vec<_>>>()?;

        Ok(Self { members, chroot })
    }
}

impl fmt::Display for ConnectString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, member) in self.members.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{member}")?;
        }
        if let Some(chroot) = &self.chroot {
            f.write_str(chroot)?;
        }
        Ok(())
    }
}

fn parse_member(raw: &str) -> Result<EnsembleMember> {
    let raw = raw.trim();
    let (host, port) = raw.rsplit_once(':').ok_or_else(|| {
        ConfigSnafu { message: format!("ensemble member '{raw}' must be host:port") }.build()
    })?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ensure!(
        !host.is_empty() && !host.contains(char::is_whitespace),
        ConfigSnafu { message: format!("ensemble member '{raw}' has an invalid host") }
    );
    let port: u16 = port.parse().map_err(|_| {
        ConfigSnafu { message: format!("ensemble member '{raw}' has an invalid port") }.build()
    })?;
    ensure!(port != 0, ConfigSnafu { message: format!("ensemble member '{raw}' has port 0") });

    Ok(EnsembleMember { host: host.to_owned(), port })
}

fn validate_root(path: &str) -> Result<()> {
    ensure!(path.starts_with('/'), ConfigSnafu { message: format!("path '{path}' must be absolute") });
    ensure!(
        path.len() == 1 || !path.ends_with('/'),
        ConfigSnafu { message: format!("path '{path}' must not end with '/'") }
    );
    ensure!(
        path.len() == 1 || !path[1..].split('/').any(str::is_empty),
        ConfigSnafu { message: format!("path '{path}' contains an empty segment") }
    );
    Ok(())
}

/// Configuration for a [`ServiceRegistry`](crate::ServiceRegistry).
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Coordination ensemble addresses.
    pub(crate) connect_string: ConnectString,

    /// Root of the service namespace (chroot already applied).
    pub(crate) root_path: String,

    /// Session timeout negotiated with the ensemble.
    pub(crate) session_timeout: Duration,

    /// Upper bound for a single coordination round-trip.
    pub(crate) operation_timeout: Duration,
}

impl RegistryConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> RegistryConfigBuilder {
        RegistryConfigBuilder::default()
    }

    /// Returns the connect string.
    #[must_use]
    pub fn connect_string(&self) -> &ConnectString {
        &self.connect_string
    }

    /// Returns the effective root path.
    #[must_use]
    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    /// Returns the session timeout.
    #[must_use]
    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    /// Returns the per-operation timeout.
    #[must_use]
    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    /// Returns the namespace path of a service.
    #[must_use]
    pub fn service_path(&self, service_id: &str) -> String {
        if self.root_path == "/" {
            format!("/{service_id}")
        } else {
            format!("{}/{service_id}", self.root_path)
        }
    }
}

/// Builder for [`RegistryConfig`].
#[derive(Debug, Default)]
pub struct RegistryConfigBuilder {
    connect_string: Option<String>,
    root_path: Option<String>,
    session_timeout: Option<Duration>,
    operation_timeout: Option<Duration>,
}

impl RegistryConfigBuilder {
    /// Sets the ensemble connect string (`host:port[,host:port...][/chroot]`).
    #[must_use]
    pub fn with_connect_string<S: Into<String>>(mut self, connect_string: S) -> Self {
        self.connect_string = Some(connect_string.into());
        self
    }

    /// Sets the namespace root. Defaults to [`DEFAULT_ROOT_PATH`].
    #[must_use]
    pub fn with_root_path<S: Into<String>>(mut self, root_path: S) -> Self {
        self.root_path = Some(root_path.into());
        self
    }

    /// Sets the session timeout.
    #[must_use]
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Sets the per-operation timeout.
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Builds the configuration, validating all settings.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - No connect string provided, or it does not parse
    /// - The root path is not absolute or has empty segments
    /// - Either timeout is zero
    pub fn build(self) -> Result<RegistryConfig> {
        let connect_string: ConnectString = self
            .connect_string
            .ok_or_else(|| ConfigSnafu { message: "connect string is required" }.build())?
            .parse()?;

        let root = self.root_path.unwrap_or_else(|| DEFAULT_ROOT_PATH.to_owned());
        validate_root(&root)?;
        let root_path = match connect_string.chroot() {
            Some(chroot) if root == "/" => chroot.to_owned(),
            Some(chroot) => format!("{chroot}{root}"),
            None => root,
        };

        let session_timeout = self.session_timeout.unwrap_or(DEFAULT_SESSION_TIMEOUT);
        ensure!(!session_timeout.is_zero(), ConfigSnafu { message: "session timeout cannot be zero" });

        let operation_timeout = self.operation_timeout.unwrap_or(DEFAULT_OPERATION_TIMEOUT);
        ensure!(
            !operation_timeout.is_zero(),
            ConfigSnafu { message: "operation timeout cannot be zero" }
        );

        Ok(RegistryConfig { connect_string, root_path, session_timeout, operation_timeout })
    }
}
