//! Plain data types that flow through the operation lifecycle: identifiers, decoded requests,
//! results, and the intermediate items a search produces.
//!
//! Nothing in here knows about wire encodings.  The transport layer decodes whatever it speaks
//! (HTTP, in the front-end this crate was built for) into a [`Request`] and hands it to
//! [`crate::OperationDispatcher::submit`]; everything downstream of that point deals only in these
//! types.
use std::fmt;

use serde::{Deserialize, Serialize};
pub use serde_json::Value as JsonValue;

/// Identifier of a single operation, scoped to the connection that submitted it.
///
/// Allocated by the dispatcher from a per-connection counter starting at 1, so within a
/// connection these are unique and strictly increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub u32);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of a client connection, assigned by the [`crate::ConnectionRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A distinguished name.  This core never parses these, it just carries them around.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dn(pub String);

impl Dn {
    pub fn new(dn: impl Into<String>) -> Self {
        Self(dn.into())
    }

    /// The empty DN, used for anonymous binds and the root DSE
    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Dn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Dn {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Result codes reported back to the client.
///
/// Only the subset that this core and typical backends produce is modelled; a backend that
/// needs something more exotic can use [`ResultCode::Other`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::IntoStaticStr,
)]
#[serde(rename_all = "camelCase")]
#[strum(serialize_all = "camelCase")]
pub enum ResultCode {
    Success,
    OperationsError,
    ProtocolError,
    TimeLimitExceeded,
    SizeLimitExceeded,
    CompareFalse,
    CompareTrue,
    NoSuchAttribute,
    NoSuchObject,
    InvalidCredentials,
    InsufficientAccessRights,
    Unavailable,
    UnwillingToPerform,
    ConstraintViolation,
    EntryAlreadyExists,
    AdminLimitExceeded,
    Other,
    Cancelled,
    NoSuchOperation,
    CannotCancel,
}

impl ResultCode {
    /// The numeric value used for this code on the wire
    pub fn as_int(&self) -> u32 {
        match self {
            ResultCode::Success => 0,
            ResultCode::OperationsError => 1,
            ResultCode::ProtocolError => 2,
            ResultCode::TimeLimitExceeded => 3,
            ResultCode::SizeLimitExceeded => 4,
            ResultCode::CompareFalse => 5,
            ResultCode::CompareTrue => 6,
            ResultCode::NoSuchAttribute => 16,
            ResultCode::NoSuchObject => 32,
            ResultCode::InvalidCredentials => 49,
            ResultCode::InsufficientAccessRights => 50,
            ResultCode::Unavailable => 52,
            ResultCode::UnwillingToPerform => 53,
            ResultCode::ConstraintViolation => 19,
            ResultCode::EntryAlreadyExists => 68,
            ResultCode::AdminLimitExceeded => 11,
            ResultCode::Other => 80,
            ResultCode::Cancelled => 118,
            ResultCode::NoSuchOperation => 119,
            ResultCode::CannotCancel => 121,
        }
    }

    /// Codes which, although they're not `Success`, still mean the operation did what was asked.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ResultCode::Success | ResultCode::CompareFalse | ResultCode::CompareTrue
        )
    }
}

/// An attribute with its (string-typed) values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub values: Vec<String>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModificationType {
    Add,
    Delete,
    Replace,
    Increment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modification {
    pub mod_type: ModificationType,
    pub attribute: Attribute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SearchScope {
    BaseObject,
    SingleLevel,
    WholeSubtree,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BindCredentials {
    Simple { password: String },
    Sasl { mechanism: String, credentials: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddRequest {
    pub dn: Dn,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindRequest {
    pub dn: Dn,
    pub credentials: BindCredentials,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareRequest {
    pub dn: Dn,
    pub attribute: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteRequest {
    pub dn: Dn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtendedRequest {
    pub oid: String,
    pub value: Option<JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyRequest {
    pub dn: Dn,
    pub changes: Vec<Modification>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyDnRequest {
    pub dn: Dn,
    pub new_rdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<Dn>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub base: Dn,
    pub scope: SearchScope,
    pub filter: String,
    #[serde(default)]
    pub attributes: Vec<String>,
    /// Zero means no limit
    #[serde(default)]
    pub size_limit: u32,
}

/// A decoded client request, one variant per operation kind, each carrying the immutable
/// parameters for that kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Request {
    Add(AddRequest),
    Bind(BindRequest),
    Compare(CompareRequest),
    Delete(DeleteRequest),
    Extended(ExtendedRequest),
    #[serde(rename = "modifyDN")]
    ModifyDn(ModifyDnRequest),
    Modify(ModifyRequest),
    Search(SearchRequest),
    Unbind,
    Abandon { target: MessageId },
}

impl Request {
    pub fn kind(&self) -> OperationKind {
        match self {
            Request::Add(_) => OperationKind::Add,
            Request::Bind(_) => OperationKind::Bind,
            Request::Compare(_) => OperationKind::Compare,
            Request::Delete(_) => OperationKind::Delete,
            Request::Extended(_) => OperationKind::Extended,
            Request::ModifyDn(_) => OperationKind::ModifyDn,
            Request::Modify(_) => OperationKind::Modify,
            Request::Search(_) => OperationKind::Search,
            Request::Unbind => OperationKind::Unbind,
            Request::Abandon { .. } => OperationKind::Abandon,
        }
    }
}

/// The kind of an operation, without its parameters.  Mostly used for logging and statistics.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumCount,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "camelCase")]
pub enum OperationKind {
    Add,
    Bind,
    Compare,
    Delete,
    Extended,
    #[strum(serialize = "modifyDN")]
    ModifyDn,
    Modify,
    Search,
    Unbind,
    Abandon,
}

impl OperationKind {
    /// Dense index of this kind, for per-kind counter arrays
    pub(crate) fn index(self) -> usize {
        self as usize
    }

    /// Whether an abandon may target an operation of this kind.  Binds, unbinds and abandons act
    /// on the connection itself; only a sweep or a disconnect cancels them.
    pub fn is_cancellable(self) -> bool {
        !matches!(self, OperationKind::Bind | OperationKind::Unbind | OperationKind::Abandon)
    }
}

/// The terminal result of an operation that the backend completed.
///
/// Note that a completed operation may still carry a non-success code; the distinction between
/// this and [`crate::DirError::OperationFailed`] is whether the backend considers the outcome a
/// normal response or a failure to perform the request at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationResult {
    pub code: ResultCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_dn: Option<Dn>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub referrals: Vec<String>,
    /// Payload of an extended operation response, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_value: Option<JsonValue>,
}

impl OperationResult {
    pub fn new(code: ResultCode) -> Self {
        Self {
            code,
            diagnostic_message: None,
            matched_dn: None,
            referrals: Vec::new(),
            response_value: None,
        }
    }

    pub fn success() -> Self {
        Self::new(ResultCode::Success)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.diagnostic_message = Some(message.into());
        self
    }

    pub fn with_matched_dn(mut self, dn: Dn) -> Self {
        self.matched_dn = Some(dn);
        self
    }

    pub fn with_response_value(mut self, value: JsonValue) -> Self {
        self.response_value = Some(value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchEntry {
    pub dn: Dn,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchReference {
    pub uris: Vec<String>,
}

/// An intermediate item produced by a search before its terminal result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SearchItem {
    Entry(SearchEntry),
    Reference(SearchReference),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strum::{EnumCount, IntoEnumIterator};

    #[test]
    fn kind_indices_are_dense() {
        let indices: Vec<_> = OperationKind::iter().map(OperationKind::index).collect();
        assert_eq!(indices, (0..OperationKind::COUNT).collect::<Vec<_>>());
    }

    #[test]
    fn kind_display_matches_protocol_names() {
        assert_eq!(OperationKind::ModifyDn.to_string(), "modifyDN");
        assert_eq!(OperationKind::Search.to_string(), "search");
        assert_eq!(ResultCode::UnwillingToPerform.to_string(), "unwillingToPerform");
    }

    #[test]
    fn decode_tagged_request() {
        let request: Request = serde_json::from_value(json!({
            "kind": "search",
            "base": "dc=example,dc=com",
            "scope": "wholeSubtree",
            "filter": "(objectClass=*)"
        }))
        .unwrap();

        assert_eq!(request.kind(), OperationKind::Search);
        let Request::Search(search) = request else {
            panic!("Expected a search request");
        };
        assert_eq!(search.base, Dn::new("dc=example,dc=com"));
        assert!(search.attributes.is_empty());
        assert_eq!(search.size_limit, 0);

        let abandon: Request = serde_json::from_value(json!({ "kind": "abandon", "target": 7 })).unwrap();
        assert_eq!(abandon, Request::Abandon { target: MessageId(7) });
    }

    #[test]
    fn compare_codes_count_as_success() {
        assert!(ResultCode::CompareFalse.is_success());
        assert!(!ResultCode::Cancelled.is_success());
        assert_eq!(ResultCode::Cancelled.as_int(), 118);
    }
}
