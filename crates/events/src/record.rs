use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use rxledger_core::{DomainError, TenantId, UserId};

use crate::Event;

/// A typed event serialized for an append-only history table.
///
/// `sequence_number` is the position in the stream (`stream_id`), starting at
/// 1. It equals the aggregate's version after the event was applied, so the
/// history can be cross-checked against the stored state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub event_id: Uuid,
    pub tenant_id: TenantId,
    pub stream_id: Uuid,
    pub stream_type: String,
    pub sequence_number: u64,

    pub event_type: String,
    pub event_version: u32,
    pub occurred_at: DateTime<Utc>,
    pub actor: UserId,

    pub payload: JsonValue,
}

impl RecordedEvent {
    /// Serialize a typed event, capturing the metadata needed to decode it later.
    pub fn from_typed<E>(
        tenant_id: TenantId,
        stream_id: Uuid,
        stream_type: impl Into<String>,
        sequence_number: u64,
        actor: UserId,
        event: &E,
    ) -> Result<Self, DomainError>
    where
        E: Event + Serialize,
    {
        let payload = serde_json::to_value(event)
            .map_err(|e| DomainError::Storage(format!("payload serialization failed: {e}")))?;

        Ok(Self {
            event_id: Uuid::now_v7(),
            tenant_id,
            stream_id,
            stream_type: stream_type.into(),
            sequence_number,
            event_type: event.event_type().to_string(),
            event_version: event.version(),
            occurred_at: event.occurred_at(),
            actor,
            payload,
        })
    }

    /// Decode the payload back into its typed event.
    pub fn decode<E>(&self) -> Result<E, DomainError>
    where
        E: Event + DeserializeOwned,
    {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| DomainError::Storage(format!("payload deserialization failed: {e}")))
    }
}

/// Ensure a loaded stream is tenant-scoped and strictly 1, 2, 3, … ordered.
pub fn validate_stream(
    tenant_id: TenantId,
    stream_id: Uuid,
    stream: &[RecordedEvent],
) -> Result<(), DomainError> {
    for (idx, e) in stream.iter().enumerate() {
        if e.tenant_id != tenant_id {
            return Err(DomainError::TenantIsolation(format!(
                "loaded stream contains wrong tenant_id at index {idx}"
            )));
        }
        if e.stream_id != stream_id {
            return Err(DomainError::TenantIsolation(format!(
                "loaded stream contains wrong stream_id at index {idx}"
            )));
        }
        let expected = idx as u64 + 1;
        if e.sequence_number != expected {
            return Err(DomainError::Storage(format!(
                "non-contiguous sequence_number in stream (expected={expected}, found={})",
                e.sequence_number
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Noted {
        note: String,
        occurred_at: DateTime<Utc>,
    }

    impl Event for Noted {
        fn event_type(&self) -> &'static str {
            "test.noted"
        }

        fn version(&self) -> u32 {
            2
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.occurred_at
        }
    }

    #[test]
    fn from_typed_captures_metadata_and_decodes() {
        let tenant_id = TenantId::new();
        let stream_id = Uuid::now_v7();
        let ev = Noted {
            note: "hello".to_string(),
            occurred_at: Utc::now(),
        };

        let rec =
            RecordedEvent::from_typed(tenant_id, stream_id, "test", 1, UserId::new(), &ev).unwrap();
        assert_eq!(rec.event_type, "test.noted");
        assert_eq!(rec.event_version, 2);
        assert_eq!(rec.occurred_at, ev.occurred_at);
        assert_eq!(rec.decode::<Noted>().unwrap(), ev);
    }

    #[test]
    fn validate_stream_rejects_gaps_and_foreign_tenants() {
        let tenant_id = TenantId::new();
        let stream_id = Uuid::now_v7();
        let ev = Noted {
            note: String::new(),
            occurred_at: Utc::now(),
        };
        let actor = UserId::new();
        let first = RecordedEvent::from_typed(tenant_id, stream_id, "test", 1, actor, &ev).unwrap();
        let third = RecordedEvent::from_typed(tenant_id, stream_id, "test", 3, actor, &ev).unwrap();
        assert!(validate_stream(tenant_id, stream_id, &[first.clone()]).is_ok());
        assert!(matches!(
            validate_stream(tenant_id, stream_id, &[first.clone(), third]),
            Err(DomainError::Storage(_))
        ));
        assert!(matches!(
            validate_stream(TenantId::new(), stream_id, &[first]),
            Err(DomainError::TenantIsolation(_))
        ));
    }
}
