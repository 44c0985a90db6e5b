//! Data types returned by `ra_svn` sessions.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

/// A Subversion property list (`name -> raw bytes`).
///
/// Property values can be binary; callers should treat the value as opaque
/// bytes unless they know it is UTF-8.
pub type PropertyList = BTreeMap<String, Vec<u8>>;

/// Repository metadata returned by the server after authentication.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepositoryInfo {
    /// Repository UUID.
    pub uuid: String,
    /// Repository root URL.
    ///
    /// Older servers may omit it; it is then an empty string.
    pub root_url: String,
    /// Server-reported repository capabilities.
    pub capabilities: Vec<String>,
}

/// Information negotiated during the initial handshake.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerInfo {
    /// Protocol version range announced in the greeting.
    pub min_version: u64,
    /// Highest protocol version the server speaks.
    pub max_version: u64,
    /// Capabilities from the greeting merged with those from `repos-info`.
    pub server_caps: Vec<String>,
    /// Repository metadata.
    pub repository: RepositoryInfo,
}

impl ServerInfo {
    /// Returns `true` if the server announced `cap`.
    pub fn has_capability(&self, cap: Capability) -> bool {
        self.server_caps.iter().any(|c| c == cap.as_wire_word())
    }
}

/// Metadata of a file streamed by [`crate::RaSvnSession::get_file`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetFileResult {
    /// The revision that was actually served.
    pub rev: u64,
    /// Checksum reported by the server, e.g. an MD5 hex digest.
    pub checksum: Option<String>,
    /// File properties.
    pub props: PropertyList,
    /// Number of bytes written to the output.
    pub bytes_written: u64,
}

/// The kind of a node in the repository.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeKind {
    /// No node exists at the requested path/revision.
    None,
    /// A file node.
    File,
    /// A directory node.
    Dir,
    /// A kind this client does not know.
    Unknown,
}

impl NodeKind {
    pub(crate) fn from_word(word: &str) -> Self {
        match word {
            "none" => Self::None,
            "file" => Self::File,
            "dir" => Self::Dir,
            _ => Self::Unknown,
        }
    }

    /// Returns the word used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::File => "file",
            Self::Dir => "dir",
            Self::Unknown => "unknown",
        }
    }
}

impl Display for NodeKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A protocol capability exchanged during the handshake.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Mandatory: the server pipelines editor commands.
    EditPipeline,
    /// svndiff1 (zlib) deltas.
    Svndiff1,
    /// svndiff2 (lz4) deltas may be sent to this client.
    AcceptsSvndiff2,
    /// `absent-dir` / `absent-file` editor commands.
    AbsentEntries,
    /// Depth parameters.
    Depth,
    /// The `get-mergeinfo` command.
    MergeInfo,
    /// Revision properties in `log`.
    LogRevProps,
}

impl Capability {
    /// Capabilities this client announces, in greeting order.
    pub const CLIENT: [Capability; 7] = [
        Capability::EditPipeline,
        Capability::Svndiff1,
        Capability::AcceptsSvndiff2,
        Capability::AbsentEntries,
        Capability::Depth,
        Capability::MergeInfo,
        Capability::LogRevProps,
    ];

    /// Returns the capability word used on the wire.
    pub fn as_wire_word(self) -> &'static str {
        match self {
            Self::EditPipeline => "edit-pipeline",
            Self::Svndiff1 => "svndiff1",
            Self::AcceptsSvndiff2 => "accepts-svndiff2",
            Self::AbsentEntries => "absent-entries",
            Self::Depth => "depth",
            Self::MergeInfo => "mergeinfo",
            Self::LogRevProps => "log-revprops",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_kind_words() {
        for kind in [NodeKind::None, NodeKind::File, NodeKind::Dir] {
            assert_eq!(NodeKind::from_word(kind.as_str()), kind);
        }
        assert_eq!(NodeKind::from_word("symlink"), NodeKind::Unknown);
        assert_eq!(NodeKind::Dir.to_string(), "dir");
    }

    #[test]
    fn server_info_checks_capabilities() {
        let info = ServerInfo {
            server_caps: vec!["edit-pipeline".into(), "mergeinfo".into()],
            ..ServerInfo::default()
        };
        assert!(info.has_capability(Capability::MergeInfo));
        assert!(!info.has_capability(Capability::Depth));
    }
}
