//! The closed channel set and its path grammar.
//!
//! A channel path is either a bare name (`sessions`) or a name plus one
//! session-scoped uuid segment (`sessionContainers/<uuid>`). Parameters are
//! represented structurally per channel rather than as a dynamic map.

use std::fmt;

/// A resolved channel: name plus parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    Projects,
    Sessions,
    SessionMetadata { uuid: String },
    SessionContainers { uuid: String },
    SessionTyping { uuid: String },
    SessionChangedFiles { uuid: String },
    SessionTasks { uuid: String },
    SessionBranches { uuid: String },
    SessionLinks { uuid: String },
    SessionLogs { uuid: String },
    SessionMessages { uuid: String },
    SessionAcpEvents { uuid: String },
    SessionBrowserState { uuid: String },
    SessionBrowserFrames { uuid: String },
    SessionBrowserInput { uuid: String },
    OrchestrationStatus { uuid: String },
    SessionComplete { uuid: String },
}

impl Channel {
    /// The static channel name (the path without parameters).
    pub fn name(&self) -> &'static str {
        match self {
            Channel::Projects => "projects",
            Channel::Sessions => "sessions",
            Channel::SessionMetadata { .. } => "sessionMetadata",
            Channel::SessionContainers { .. } => "sessionContainers",
            Channel::SessionTyping { .. } => "sessionTyping",
            Channel::SessionChangedFiles { .. } => "sessionChangedFiles",
            Channel::SessionTasks { .. } => "sessionTasks",
            Channel::SessionBranches { .. } => "sessionBranches",
            Channel::SessionLinks { .. } => "sessionLinks",
            Channel::SessionLogs { .. } => "sessionLogs",
            Channel::SessionMessages { .. } => "sessionMessages",
            Channel::SessionAcpEvents { .. } => "sessionAcpEvents",
            Channel::SessionBrowserState { .. } => "sessionBrowserState",
            Channel::SessionBrowserFrames { .. } => "sessionBrowserFrames",
            Channel::SessionBrowserInput { .. } => "sessionBrowserInput",
            Channel::OrchestrationStatus { .. } => "orchestrationStatus",
            Channel::SessionComplete { .. } => "sessionComplete",
        }
    }

    /// The uuid parameter, for session-scoped channels.
    pub fn uuid(&self) -> Option<&str> {
        match self {
            Channel::Projects | Channel::Sessions => None,
            Channel::SessionMetadata { uuid }
            | Channel::SessionContainers { uuid }
            | Channel::SessionTyping { uuid }
            | Channel::SessionChangedFiles { uuid }
            | Channel::SessionTasks { uuid }
            | Channel::SessionBranches { uuid }
            | Channel::SessionLinks { uuid }
            | Channel::SessionLogs { uuid }
            | Channel::SessionMessages { uuid }
            | Channel::SessionAcpEvents { uuid }
            | Channel::SessionBrowserState { uuid }
            | Channel::SessionBrowserFrames { uuid }
            | Channel::SessionBrowserInput { uuid }
            | Channel::OrchestrationStatus { uuid }
            | Channel::SessionComplete { uuid } => Some(uuid),
        }
    }

    /// Parse a resolved path (`name` or `name/uuid`) into a channel.
    ///
    /// Returns `None` for unknown names, missing or superfluous parameters,
    /// and paths with more than two segments.
    pub fn parse(path: &str) -> Option<Channel> {
        let mut segments = path.splitn(3, '/');
        let name = segments.next()?;
        let param = segments.next();
        if segments.next().is_some() {
            return None;
        }

        match (name, param) {
            ("projects", None) => Some(Channel::Projects),
            ("sessions", None) => Some(Channel::Sessions),
            (_, None) | (_, Some("")) => None,
            (name, Some(uuid)) => {
                let uuid = uuid.to_string();
                match name {
                    "sessionMetadata" => Some(Channel::SessionMetadata { uuid }),
                    "sessionContainers" => Some(Channel::SessionContainers { uuid }),
                    "sessionTyping" => Some(Channel::SessionTyping { uuid }),
                    "sessionChangedFiles" => Some(Channel::SessionChangedFiles { uuid }),
                    "sessionTasks" => Some(Channel::SessionTasks { uuid }),
                    "sessionBranches" => Some(Channel::SessionBranches { uuid }),
                    "sessionLinks" => Some(Channel::SessionLinks { uuid }),
                    "sessionLogs" => Some(Channel::SessionLogs { uuid }),
                    "sessionMessages" => Some(Channel::SessionMessages { uuid }),
                    "sessionAcpEvents" => Some(Channel::SessionAcpEvents { uuid }),
                    "sessionBrowserState" => Some(Channel::SessionBrowserState { uuid }),
                    "sessionBrowserFrames" => Some(Channel::SessionBrowserFrames { uuid }),
                    "sessionBrowserInput" => Some(Channel::SessionBrowserInput { uuid }),
                    "orchestrationStatus" => Some(Channel::OrchestrationStatus { uuid }),
                    "sessionComplete" => Some(Channel::SessionComplete { uuid }),
                    _ => None,
                }
            }
        }
    }

    /// The resolved path for this channel.
    pub fn path(&self) -> String {
        match self.uuid() {
            Some(uuid) => format!("{}/{}", self.name(), uuid),
            None => self.name().to_string(),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}
