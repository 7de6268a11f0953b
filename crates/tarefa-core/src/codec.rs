use std::sync::Arc;

use serde_json::Value;

use crate::error::{CodecError, ConfigError};

/// Pluggable payload codec. Converters are tried in order; returning `None`
/// means "not my format" and hands the payload to the next converter in the
/// chain, `Some(Err(_))` means the converter claimed the payload but failed.
pub trait MessageConverter: Send + Sync {
    /// Converter name for logs.
    fn name(&self) -> &'static str;

    fn decode(&self, payload: &[u8]) -> Option<Result<Value, CodecError>>;

    fn encode(&self, value: &Value) -> Option<Result<Vec<u8>, CodecError>>;
}

/// JSON converter, the default chain entry.
pub struct JsonMessageConverter;

impl MessageConverter for JsonMessageConverter {
    fn name(&self) -> &'static str {
        "json"
    }

    fn decode(&self, payload: &[u8]) -> Option<Result<Value, CodecError>> {
        Some(serde_json::from_slice(payload).map_err(|e| CodecError::Decode(e.to_string())))
    }

    fn encode(&self, value: &Value) -> Option<Result<Vec<u8>, CodecError>> {
        Some(serde_json::to_vec(value).map_err(|e| CodecError::Encode(e.to_string())))
    }
}

/// Ordered, non-empty converter chain. The first converter that answers —
/// successfully or not — wins.
#[derive(Clone)]
pub struct ConverterChain {
    converters: Vec<Arc<dyn MessageConverter>>,
}

impl ConverterChain {
    pub fn new(converters: Vec<Arc<dyn MessageConverter>>) -> Result<Self, ConfigError> {
        if converters.is_empty() {
            return Err(ConfigError::EmptyConverterChain);
        }
        Ok(Self { converters })
    }

    /// The default chain: JSON only.
    pub fn json() -> Self {
        Self {
            converters: vec![Arc::new(JsonMessageConverter)],
        }
    }

    pub fn decode(&self, payload: &[u8]) -> Result<Value, CodecError> {
        for converter in &self.converters {
            if let Some(result) = converter.decode(payload) {
                return result;
            }
        }
        Err(CodecError::Unhandled)
    }

    pub fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        for converter in &self.converters {
            if let Some(result) = converter.encode(value) {
                return result;
            }
        }
        Err(CodecError::Unhandled)
    }
}

impl Default for ConverterChain {
    fn default() -> Self {
        Self::json()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Only handles payloads starting with a magic byte.
    struct MagicConverter;

    impl MessageConverter for MagicConverter {
        fn name(&self) -> &'static str {
            "magic"
        }

        fn decode(&self, payload: &[u8]) -> Option<Result<Value, CodecError>> {
            if payload.first() == Some(&0xFF) {
                Some(Ok(json!({"magic": true})))
            } else {
                None
            }
        }

        fn encode(&self, _value: &Value) -> Option<Result<Vec<u8>, CodecError>> {
            None
        }
    }

    #[test]
    fn empty_chain_is_rejected() {
        assert!(matches!(
            ConverterChain::new(vec![]),
            Err(ConfigError::EmptyConverterChain)
        ));
    }

    #[test]
    fn json_roundtrip() {
        let chain = ConverterChain::json();
        let value = json!({"order": 7});
        let bytes = chain.encode(&value).unwrap();
        assert_eq!(chain.decode(&bytes).unwrap(), value);
    }

    #[test]
    fn first_answering_converter_wins() {
        let chain = ConverterChain::new(vec![
            Arc::new(MagicConverter),
            Arc::new(JsonMessageConverter),
        ])
        .unwrap();

        assert_eq!(chain.decode(&[0xFF]).unwrap(), json!({"magic": true}));
        // Magic passes, JSON picks it up.
        assert_eq!(chain.decode(b"{\"n\":1}").unwrap(), json!({"n": 1}));
    }

    #[test]
    fn claimed_but_failed_decode_is_an_error() {
        let chain = ConverterChain::json();
        assert!(matches!(
            chain.decode(b"not json"),
            Err(CodecError::Decode(_))
        ));
    }

    #[test]
    fn unhandled_payload_reports_unhandled() {
        let chain = ConverterChain::new(vec![Arc::new(MagicConverter)]).unwrap();
        assert!(matches!(chain.decode(b"plain"), Err(CodecError::Unhandled)));
    }
}
