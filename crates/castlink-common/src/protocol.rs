use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Offer/answer discriminator carried in `sdp.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl std::fmt::Display for SdpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SdpType::Offer => f.write_str("offer"),
            SdpType::Answer => f.write_str("answer"),
        }
    }
}

/// Session description as exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in the browser `RTCIceCandidateInit` shape.
///
/// The candidate line itself is opaque at this layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Offer,
    Answer,
    Candidate,
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeKind::Offer => f.write_str("offer"),
            EnvelopeKind::Answer => f.write_str("answer"),
            EnvelopeKind::Candidate => f.write_str("candidate"),
        }
    }
}

/// The unit exchanged over the relay.
///
/// On the wire this is `{"sdp": {...}}` or `{"candidate": {...}}`; an object
/// carrying both or neither never decodes into an `Envelope`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub enum Envelope {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

impl Envelope {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Envelope::Description(SessionDescription::offer(sdp))
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Envelope::Description(SessionDescription::answer(sdp))
    }

    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::Description(desc) => match desc.sdp_type {
                SdpType::Offer => EnvelopeKind::Offer,
                SdpType::Answer => EnvelopeKind::Answer,
            },
            Envelope::Candidate(_) => EnvelopeKind::Candidate,
        }
    }

    pub fn from_json(text: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(text).map_err(EnvelopeError::from)
    }

    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        serde_json::to_string(self).map_err(EnvelopeError::from)
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("envelope carries both sdp and candidate")]
    Ambiguous,
    #[error("envelope carries neither sdp nor candidate")]
    Empty,
    #[error("malformed envelope: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for EnvelopeError {
    fn from(err: serde_json::Error) -> Self {
        // try_from failures surface through serde as custom messages
        let msg = err.to_string();
        if msg.starts_with(AMBIGUOUS_MSG) {
            EnvelopeError::Ambiguous
        } else if msg.starts_with(EMPTY_MSG) {
            EnvelopeError::Empty
        } else {
            EnvelopeError::Malformed(msg)
        }
    }
}

const AMBIGUOUS_MSG: &str = "envelope carries both sdp and candidate";
const EMPTY_MSG: &str = "envelope carries neither sdp nor candidate";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sdp: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    candidate: Option<IceCandidate>,
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = &'static str;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        match (wire.sdp, wire.candidate) {
            (Some(sdp), None) => Ok(Envelope::Description(sdp)),
            (None, Some(candidate)) => Ok(Envelope::Candidate(candidate)),
            (Some(_), Some(_)) => Err(AMBIGUOUS_MSG),
            (None, None) => Err(EMPTY_MSG),
        }
    }
}

impl From<Envelope> for WireEnvelope {
    fn from(envelope: Envelope) -> Self {
        match envelope {
            Envelope::Description(sdp) => WireEnvelope {
                sdp: Some(sdp),
                candidate: None,
            },
            Envelope::Candidate(candidate) => WireEnvelope {
                sdp: None,
                candidate: Some(candidate),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_offer() {
        let env = Envelope::from_json(r#"{"sdp":{"type":"offer","sdp":"v=0..."}}"#).unwrap();
        assert_eq!(env.kind(), EnvelopeKind::Offer);
        assert_eq!(env, Envelope::offer("v=0..."));
    }

    #[test]
    fn test_decode_browser_candidate() {
        let text = r#"{"candidate":{"candidate":"candidate:1 1 udp 2130706431 192.0.2.1 54321 typ host","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"abcd"}}"#;
        let env = Envelope::from_json(text).unwrap();
        let Envelope::Candidate(c) = env else {
            panic!("expected candidate");
        };
        assert_eq!(c.sdp_mid.as_deref(), Some("0"));
        assert_eq!(c.sdp_mline_index, Some(0));
        assert_eq!(c.username_fragment.as_deref(), Some("abcd"));
    }

    #[test]
    fn test_encode_candidate_uses_browser_field_names() {
        let mut c = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 9 typ host");
        c.sdp_mid = Some("video".into());
        c.sdp_mline_index = Some(1);
        let json = Envelope::Candidate(c).to_json().unwrap();
        assert!(json.contains(r#""sdpMid":"video""#));
        assert!(json.contains(r#""sdpMLineIndex":1"#));
        assert!(!json.contains("usernameFragment"));
        assert!(!json.contains(r#""sdp":"#));
    }

    #[test]
    fn test_reject_both_fields() {
        let text = r#"{"sdp":{"type":"offer","sdp":"v=0"},"candidate":{"candidate":"x"}}"#;
        assert!(matches!(
            Envelope::from_json(text),
            Err(EnvelopeError::Ambiguous)
        ));
    }

    #[test]
    fn test_reject_neither_field() {
        assert!(matches!(Envelope::from_json("{}"), Err(EnvelopeError::Empty)));
    }

    #[test]
    fn test_reject_unknown_sdp_type() {
        let text = r#"{"sdp":{"type":"pranswer","sdp":"v=0"}}"#;
        assert!(matches!(
            Envelope::from_json(text),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn test_reject_non_json() {
        assert!(matches!(
            Envelope::from_json("hello"),
            Err(EnvelopeError::Malformed(_))
        ));
    }
}
