use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid {kind}: {reason}")]
    InvalidIdentifier { kind: &'static str, reason: String },

    #[error("document list could not be encoded: {0}")]
    Encoding(String),
}

fn validate_identifier(
    kind: &'static str,
    value: &str,
    max_len: usize,
) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::InvalidIdentifier {
            kind,
            reason: "cannot be empty".into(),
        });
    }
    if value.len() > max_len {
        return Err(ValidationError::InvalidIdentifier {
            kind,
            reason: format!("exceeds {} characters", max_len),
        });
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(ValidationError::InvalidIdentifier {
            kind,
            reason: "contains invalid characters (allowed: a-z, A-Z, 0-9, -, _, .)".into(),
        });
    }
    Ok(())
}

/// Name of a configured target-system destination, e.g. `DEST1`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Destination(String);

impl Destination {
    const MAX_LENGTH: usize = 64;

    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into().trim().to_string();
        validate_identifier("destination", &name, Self::MAX_LENGTH)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Logical flow (queue) name within a destination.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowName(String);

impl FlowName {
    const MAX_LENGTH: usize = 128;
    pub const DEFAULT: &'static str = "default";

    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into().trim().to_string();
        validate_identifier("flow name", &name, Self::MAX_LENGTH)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for FlowName {
    fn default() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

impl fmt::Display for FlowName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one logical unit of work: a destination plus a flow on it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionKey {
    destination: Destination,
    flow: FlowName,
}

impl TransactionKey {
    pub fn new(destination: Destination, flow: FlowName) -> Self {
        Self { destination, flow }
    }

    /// Key on the default flow of `destination`.
    pub fn for_destination(destination: Destination) -> Self {
        Self::new(destination, FlowName::default())
    }

    /// Convenience constructor validating both parts.
    pub fn parse(destination: &str, flow: &str) -> Result<Self, ValidationError> {
        Ok(Self::new(Destination::new(destination)?, FlowName::new(flow)?))
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn flow(&self) -> &FlowName {
        &self.flow
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.destination, self.flow)
    }
}

/// Opaque transaction identifier issued by the target system.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(String);

impl TransactionId {
    const MAX_LENGTH: usize = 64;

    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into().trim().to_string();
        validate_identifier("transaction id", &id, Self::MAX_LENGTH)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    pub fn saturating_add(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }

    pub fn elapsed_since(self, earlier: UnixTimeMs) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

// ============================================================================
// Document payload
// ============================================================================

/// A single IDoc. The segment data is carried as opaque bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub number: String,
    #[serde(with = "serde_bytes")]
    pub segments: Vec<u8>,
}

impl Document {
    pub fn new(number: impl Into<String>, segments: impl Into<Vec<u8>>) -> Self {
        Self {
            number: number.into(),
            segments: segments.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentList {
    pub idoc_type: String,
    pub idoc_type_extension: Option<String>,
    pub system_release: Option<String>,
    pub application_release: Option<String>,
    pub documents: Vec<Document>,
}

impl DocumentList {
    pub fn new(idoc_type: impl Into<String>) -> Self {
        Self {
            idoc_type: idoc_type.into(),
            idoc_type_extension: None,
            system_release: None,
            application_release: None,
            documents: Vec::new(),
        }
    }

    /// Builds a list of empty-bodied documents from their numbers.
    pub fn from_numbers<I, S>(idoc_type: impl Into<String>, numbers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut list = Self::new(idoc_type);
        list.documents = numbers
            .into_iter()
            .map(|n| Document::new(n, Vec::new()))
            .collect();
        list
    }

    pub fn with_document(mut self, document: Document) -> Self {
        self.documents.push(document);
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.idoc_type_extension = Some(extension.into());
        self
    }

    pub fn with_releases(
        mut self,
        system_release: impl Into<String>,
        application_release: impl Into<String>,
    ) -> Self {
        self.system_release = Some(system_release.into());
        self.application_release = Some(application_release.into());
        self
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// BLAKE3 over the CBOR encoding; identical lists always fingerprint equal.
    pub fn fingerprint(&self) -> Result<PayloadFingerprint, ValidationError> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| ValidationError::Encoding(e.to_string()))?;
        Ok(PayloadFingerprint(*blake3::hash(&bytes).as_bytes()))
    }

    /// JSON rendering used for debug diagnostics only.
    pub fn to_debug_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadFingerprint([u8; 32]);

impl PayloadFingerprint {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for PayloadFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PayloadFingerprint({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for PayloadFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

// ============================================================================
// Inbound request
// ============================================================================

/// What the integration layer hands over once headers and properties are
/// already propagated.
#[derive(Clone, Debug, PartialEq)]
pub struct SendRequest {
    pub destination: Destination,
    pub flow: Option<FlowName>,
    pub payload: Option<DocumentList>,
    pub timeout: Option<Duration>,
}

impl SendRequest {
    pub fn new(destination: Destination, payload: Option<DocumentList>) -> Self {
        Self {
            destination,
            flow: None,
            payload,
            timeout: None,
        }
    }

    pub fn with_flow(mut self, flow: FlowName) -> Self {
        self.flow = Some(flow);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn key(&self) -> TransactionKey {
        TransactionKey::new(
            self.destination.clone(),
            self.flow.clone().unwrap_or_default(),
        )
    }
}
