use time::OffsetDateTime;

use crate::engine::RawRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub key: String,
    pub value: Option<Vec<u8>>,
}

/// A record delivered to this consumer. Owns its data, independent of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    topic: String,
    partition: i32,
    offset: i64,
    key: Option<Vec<u8>>,
    payload: Option<Vec<u8>>,
    timestamp: Option<OffsetDateTime>,
    headers: Vec<MessageHeader>,
}

impl Message {
    /// Copy a raw engine record into an owned message.
    pub fn from_record<R: RawRecord + ?Sized>(record: &R) -> Self {
        Self {
            topic: record.topic().to_owned(),
            partition: record.partition(),
            offset: record.offset(),
            key: record.key().map(<[u8]>::to_vec),
            payload: record.payload().map(<[u8]>::to_vec),
            timestamp: record.timestamp_millis().and_then(timestamp_from_millis),
            headers: record.headers(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    /// `None` for tombstones.
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn payload_str(&self) -> Option<&str> {
        self.payload().and_then(|p| std::str::from_utf8(p).ok())
    }

    pub fn timestamp(&self) -> Option<OffsetDateTime> {
        self.timestamp
    }

    pub fn headers(&self) -> &[MessageHeader] {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&MessageHeader> {
        self.headers.iter().find(|header| header.key == key)
    }
}

fn timestamp_from_millis(millis: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    struct Record {
        key: Option<Vec<u8>>,
        payload: Option<Vec<u8>>,
        timestamp: Option<i64>,
    }

    impl RawRecord for Record {
        fn topic(&self) -> &str {
            "orders"
        }

        fn partition(&self) -> i32 {
            2
        }

        fn offset(&self) -> i64 {
            41
        }

        fn key(&self) -> Option<&[u8]> {
            self.key.as_deref()
        }

        fn payload(&self) -> Option<&[u8]> {
            self.payload.as_deref()
        }

        fn timestamp_millis(&self) -> Option<i64> {
            self.timestamp
        }

        fn headers(&self) -> Vec<MessageHeader> {
            vec![MessageHeader {
                key: "trace-id".to_owned(),
                value: Some(b"abc".to_vec()),
            }]
        }
    }

    #[test]
    fn copies_record_fields() {
        let record = Record {
            key: Some(b"customer-1".to_vec()),
            payload: Some(b"{\"total\": 12}".to_vec()),
            timestamp: Some(1_700_000_000_123),
        };
        let message = Message::from_record(&record);

        assert_eq!(message.topic(), "orders");
        assert_eq!(message.partition(), 2);
        assert_eq!(message.offset(), 41);
        assert_eq!(message.key(), Some(&b"customer-1"[..]));
        assert_eq!(message.payload_str(), Some("{\"total\": 12}"));
        assert_eq!(
            message.timestamp(),
            Some(datetime!(2023-11-14 22:13:20.123 UTC))
        );
        assert_eq!(
            message.header("trace-id").and_then(|h| h.value.as_deref()),
            Some(&b"abc"[..])
        );
        assert!(message.header("missing").is_none());
    }

    #[test]
    fn tombstone_without_timestamp() {
        let record = Record {
            key: None,
            payload: None,
            timestamp: None,
        };
        let message = Message::from_record(&record);

        assert_eq!(message.key(), None);
        assert_eq!(message.payload(), None);
        assert_eq!(message.timestamp(), None);
    }
}
