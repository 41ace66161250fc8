use std::collections::HashMap;
use std::fmt;

/// Partition placeholder for entries that target every partition of a topic,
/// as used by subscriptions before the group assigns concrete partitions.
pub const PARTITION_UNASSIGNED: i32 = -1;

const RAW_OFFSET_BEGINNING: i64 = -2;
const RAW_OFFSET_INVALID: i64 = -1;
const RAW_OFFSET_STORED: i64 = -1000;
const RAW_OFFSET_UNSET: i64 = -1001;

/// A partition offset, either a real position or one of the engine's sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Offset {
    /// No committed or stored offset exists.
    Unset,
    /// No valid position. Shares its raw value with librdkafka's log-end marker.
    Invalid,
    /// Start from the oldest retained message.
    Beginning,
    /// Resume from the offset stored for the group.
    Stored,
    /// A real offset within the partition.
    At(i64),
}

impl Offset {
    pub fn to_raw(self) -> i64 {
        match self {
            Offset::Unset => RAW_OFFSET_UNSET,
            Offset::Invalid => RAW_OFFSET_INVALID,
            Offset::Beginning => RAW_OFFSET_BEGINNING,
            Offset::Stored => RAW_OFFSET_STORED,
            Offset::At(offset) => offset,
        }
    }

    /// Decode an offset from its raw engine value. Negative values that are not
    /// a known sentinel decode as `Invalid`.
    pub fn from_raw(raw: i64) -> Offset {
        match raw {
            offset if offset >= 0 => Offset::At(offset),
            RAW_OFFSET_UNSET => Offset::Unset,
            RAW_OFFSET_STORED => Offset::Stored,
            RAW_OFFSET_BEGINNING => Offset::Beginning,
            _ => Offset::Invalid,
        }
    }

    pub fn is_real(self) -> bool {
        matches!(self, Offset::At(_))
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Offset::Unset => write!(f, "unset"),
            Offset::Invalid => write!(f, "invalid"),
            Offset::Beginning => write!(f, "beginning"),
            Offset::Stored => write!(f, "stored"),
            Offset::At(offset) => write!(f, "{}", offset),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPartitionEntry {
    pub topic: String,
    pub partition: i32,
    pub offset: Offset,
    /// Opaque data committed alongside the offset.
    pub metadata: String,
}

impl TopicPartitionEntry {
    pub fn new(topic: &str, partition: i32, offset: Offset) -> Self {
        Self {
            topic: topic.to_owned(),
            partition,
            offset,
            metadata: String::new(),
        }
    }

    pub fn is_unassigned(&self) -> bool {
        self.partition == PARTITION_UNASSIGNED
    }
}

impl fmt::Display for TopicPartitionEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_unassigned() {
            write!(f, "{}/*", self.topic)
        } else {
            write!(f, "{}/{}@{}", self.topic, self.partition, self.offset)
        }
    }
}

/// An ordered set of (topic, partition, offset) targets exchanged with the engine
/// for subscriptions, assignments, commits and offset queries.
///
/// A (topic, partition) pair appears at most once: adding an existing pair
/// updates that entry in place, keeping its position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicPartitionList {
    entries: Vec<TopicPartitionEntry>,
}

impl TopicPartitionList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Build a list with one unassigned entry per distinct topic, leaving
    /// partitions and offsets for the broker to resolve.
    pub fn with_topics<I, T>(topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let mut list = Self::new();
        for topic in topics {
            list.add_topic_unassigned(topic.as_ref());
        }
        list
    }

    pub fn add_topic_unassigned(&mut self, topic: &str) {
        self.add_partition_offset(topic, PARTITION_UNASSIGNED, Offset::Unset);
    }

    pub fn add_partition(&mut self, topic: &str, partition: i32) {
        self.add_partition_offset(topic, partition, Offset::Unset);
    }

    pub fn add_partition_offset(&mut self, topic: &str, partition: i32, offset: Offset) {
        match self.position_of(topic, partition) {
            Some(index) => self.entries[index].offset = offset,
            None => self
                .entries
                .push(TopicPartitionEntry::new(topic, partition, offset)),
        }
    }

    /// Attach commit metadata to an existing entry. Returns false when the pair
    /// is not part of the list.
    pub fn set_partition_metadata(&mut self, topic: &str, partition: i32, metadata: &str) -> bool {
        match self.position_of(topic, partition) {
            Some(index) => {
                self.entries[index].metadata = metadata.to_owned();
                true
            }
            None => false,
        }
    }

    pub fn find_partition(&self, topic: &str, partition: i32) -> Option<&TopicPartitionEntry> {
        self.position_of(topic, partition)
            .map(|index| &self.entries[index])
    }

    pub fn set_all_offsets(&mut self, offset: Offset) {
        for entry in self.entries.iter_mut() {
            entry.offset = offset;
        }
    }

    pub fn elements(&self) -> &[TopicPartitionEntry] {
        &self.entries
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TopicPartitionEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct topics, in order of first appearance.
    pub fn topics(&self) -> Vec<&str> {
        let mut topics: Vec<&str> = Vec::new();
        for entry in &self.entries {
            if !topics.contains(&entry.topic.as_str()) {
                topics.push(&entry.topic);
            }
        }
        topics
    }

    /// Entries grouped by topic. Each topic's entries keep their list order.
    pub fn topic_map(&self) -> HashMap<String, Vec<TopicPartitionEntry>> {
        let mut map: HashMap<String, Vec<TopicPartitionEntry>> = HashMap::new();
        for entry in &self.entries {
            map.entry(entry.topic.clone())
                .or_default()
                .push(entry.clone());
        }
        map
    }

    pub fn has_unassigned(&self) -> bool {
        self.entries.iter().any(TopicPartitionEntry::is_unassigned)
    }

    fn position_of(&self, topic: &str, partition: i32) -> Option<usize> {
        self.entries
            .iter()
            .position(|entry| entry.partition == partition && entry.topic == topic)
    }
}

impl FromIterator<TopicPartitionEntry> for TopicPartitionList {
    fn from_iter<I: IntoIterator<Item = TopicPartitionEntry>>(iter: I) -> Self {
        let mut list = Self::new();
        for entry in iter {
            match list.position_of(&entry.topic, entry.partition) {
                Some(index) => list.entries[index] = entry,
                None => list.entries.push(entry),
            }
        }
        list
    }
}

impl<'a> IntoIterator for &'a TopicPartitionList {
    type Item = &'a TopicPartitionEntry;
    type IntoIter = std::slice::Iter<'a, TopicPartitionEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl fmt::Display for TopicPartitionList {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[")?;
        for (index, entry) in self.entries.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", entry)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_offsets() {
        assert_eq!(Offset::Unset.to_raw(), -1001);
        assert_eq!(Offset::Invalid.to_raw(), -1);
        assert_eq!(Offset::At(42).to_raw(), 42);

        assert_eq!(Offset::from_raw(-1001), Offset::Unset);
        assert_eq!(Offset::from_raw(-1000), Offset::Stored);
        assert_eq!(Offset::from_raw(-2), Offset::Beginning);
        assert_eq!(Offset::from_raw(-1), Offset::Invalid);
        assert_eq!(Offset::from_raw(-2000), Offset::Invalid);
        assert_eq!(Offset::from_raw(0), Offset::At(0));
    }

    #[test]
    fn with_topics_yields_one_unassigned_entry_per_topic() {
        let list = TopicPartitionList::with_topics(["orders", "payments", "orders"]);

        assert_eq!(list.len(), 2);
        assert_eq!(list.topics(), vec!["orders", "payments"]);
        for entry in &list {
            assert!(entry.is_unassigned());
            assert_eq!(entry.offset, Offset::Unset);
        }
    }

    #[test]
    fn adding_an_existing_pair_updates_in_place() {
        let mut list = TopicPartitionList::new();
        list.add_partition("orders", 0);
        list.add_partition("orders", 1);
        list.add_partition_offset("orders", 0, Offset::At(12));

        assert_eq!(list.len(), 2);
        assert_eq!(list.elements()[0].partition, 0);
        assert_eq!(list.elements()[0].offset, Offset::At(12));
        assert_eq!(list.elements()[1].offset, Offset::Unset);
    }

    #[test]
    fn topic_map_groups_entries_in_order() {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset("orders", 2, Offset::At(5));
        list.add_partition_offset("payments", 0, Offset::At(1));
        list.add_partition_offset("orders", 0, Offset::At(7));

        let map = list.topic_map();
        assert_eq!(map.len(), 2);
        let partitions: Vec<i32> = map["orders"].iter().map(|e| e.partition).collect();
        assert_eq!(partitions, vec![2, 0]);
        assert_eq!(map["payments"][0].offset, Offset::At(1));
    }

    #[test]
    fn metadata_only_set_on_known_pairs() {
        let mut list = TopicPartitionList::new();
        list.add_partition("orders", 0);

        assert!(list.set_partition_metadata("orders", 0, "checkpoint-7"));
        assert!(!list.set_partition_metadata("orders", 3, "nope"));
        assert_eq!(
            list.find_partition("orders", 0).map(|e| e.metadata.as_str()),
            Some("checkpoint-7")
        );
    }

    #[test]
    fn collect_deduplicates_pairs() {
        let list: TopicPartitionList = vec![
            TopicPartitionEntry::new("orders", 0, Offset::At(1)),
            TopicPartitionEntry::new("orders", 0, Offset::At(3)),
        ]
        .into_iter()
        .collect();

        assert_eq!(list.len(), 1);
        assert_eq!(list.elements()[0].offset, Offset::At(3));
    }

    #[test]
    fn display() {
        let mut list = TopicPartitionList::with_topics(["payments"]);
        list.add_partition_offset("orders", 0, Offset::At(12));
        list.add_partition("orders", 1);

        assert_eq!(
            list.to_string(),
            "[payments/*, orders/0@12, orders/1@unset]"
        );
    }
}
