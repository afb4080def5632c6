use std::fmt;

/// How a server instance is owned once launched.
///
/// NOTE: `Session` processes outlive the supervisor; `Direct` ones do not.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchMode {
    #[default]
    Session,
    Direct,
}

impl fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchMode::Session => write!(f, "session"),
            LaunchMode::Direct => write!(f, "direct"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Success,
    Warning,
    Error,
}

/// Stable machine-readable reason attached to non-success outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Configuration,
    AlreadyManaged,
    NotManaged,
    StopTimeout,
    Protocol,
    ProtocolTimeout,
    Filesystem,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Outcome {
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    pub message: String,
}

impl Outcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Success,
            code: None,
            message: message.into(),
        }
    }

    pub fn warning(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            code: Some(code),
            message: message.into(),
        }
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            code: Some(code),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.severity == Severity::Success
    }

    pub fn is_warning(&self) -> bool {
        self.severity == Severity::Warning
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InstanceState {
    Stopped,
    /// A launch is in flight; no pid or session is known yet.
    Starting,
    RunningDirect { pid: u32 },
    RunningSession { session: String },
}

impl InstanceState {
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            InstanceState::RunningDirect { .. } | InstanceState::RunningSession { .. }
        )
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceState::Stopped => write!(f, "stopped"),
            InstanceState::Starting => write!(f, "starting"),
            InstanceState::RunningDirect { pid } => write!(f, "running (direct, pid {pid})"),
            InstanceState::RunningSession { session } => {
                write!(f, "running (session {session})")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StatusView {
    pub name: String,
    #[serde(flatten)]
    pub state: InstanceState,
    pub has_config: bool,
    pub rcon_available: bool,
    pub server_port: u16,
    pub log_exists: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_constructors_set_severity() {
        assert!(Outcome::success("ok").is_success());
        let w = Outcome::warning(ErrorCode::NotManaged, "already stopped");
        assert!(w.is_warning());
        assert_eq!(w.code, Some(ErrorCode::NotManaged));
        assert!(Outcome::error(ErrorCode::Configuration, "bad").is_error());
    }

    #[test]
    fn outcome_serializes_snake_case_and_skips_empty_code() {
        let v = serde_json::to_value(Outcome::success("started")).unwrap();
        assert_eq!(v["severity"], "success");
        assert!(v.get("code").is_none());

        let v = serde_json::to_value(Outcome::error(ErrorCode::ProtocolTimeout, "slow")).unwrap();
        assert_eq!(v["code"], "protocol_timeout");
    }

    #[test]
    fn status_view_flattens_state_tag() {
        let view = StatusView {
            name: "lobby".to_string(),
            state: InstanceState::RunningDirect { pid: 42 },
            has_config: true,
            rcon_available: false,
            server_port: 25565,
            log_exists: true,
        };
        let v = serde_json::to_value(&view).unwrap();
        assert_eq!(v["state"], "running_direct");
        assert_eq!(v["pid"], 42);
        assert!(view.state.is_running());
    }

    #[test]
    fn launch_mode_defaults_to_session() {
        assert_eq!(LaunchMode::default(), LaunchMode::Session);
        let m: LaunchMode = serde_json::from_str("\"direct\"").unwrap();
        assert_eq!(m, LaunchMode::Direct);
    }
}
