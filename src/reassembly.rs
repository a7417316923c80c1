//! Reassembly of concatenated SMS fragments into logical messages.
//!
//! Fragments are grouped by `(type, counterpart, reference, total)`, where
//! counterpart is the sender for SMS-DELIVER and the recipient for
//! SMS-SUBMIT, and merged once every sequence slot is filled. The same
//! algorithm runs in two modes: over a whole `CMGL` listing (incomplete
//! buckets are flushed with `[?]` placeholders at the end), and live, one
//! `+CMTI`-triggered fragment at a time (incomplete buckets simply wait).
use crate::cmd::sms::{ConcatInfo, ConcatState, SmsMessage};
use crate::pdu::PduType;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    kind: PduType,
    counterpart: String,
    reference: u16,
    total: u8,
}

#[derive(Debug)]
struct Bucket {
    /// The first-seen fragment; the merged message keeps its identity
    /// (index, status, addresses, date).
    template: SmsMessage,
    texts: Vec<Option<String>>,
    indexes: Vec<Option<u32>>,
    filled: usize,
}

impl Bucket {
    fn new(template: SmsMessage, total: u8) -> Self {
        Self {
            template,
            texts: vec![None; total as usize],
            indexes: vec![None; total as usize],
            filled: 0,
        }
    }
    /// Stores one fragment. A duplicate sequence overwrites its slot
    /// without growing the bucket.
    fn insert(&mut self, sequence: u8, text: String, index: u32) {
        let slot = sequence as usize - 1;
        if self.texts[slot].is_none() {
            self.filled += 1;
        }
        self.texts[slot] = Some(text);
        self.indexes[slot] = Some(index);
    }
    fn is_complete(&self) -> bool {
        self.filled == self.texts.len()
    }
    /// Produces the merged message; missing slots read `[?]` and keep an
    /// unknown index.
    fn finalize(self, key: &BucketKey) -> SmsMessage {
        let mut msg = self.template;
        msg.text = self
            .texts
            .into_iter()
            .map(|t| t.unwrap_or_else(|| "[?]".to_string()))
            .collect();
        msg.concat = Some(ConcatInfo {
            reference: key.reference,
            total: key.total,
            state: ConcatState::Merged {
                indexes: self.indexes,
            },
        });
        msg
    }
}

fn fragment_key(msg: &SmsMessage) -> Option<(BucketKey, u8)> {
    let concat = msg.concat.as_ref()?;
    let ConcatState::Fragment { sequence } = &concat.state else {
        return None;
    };
    let sequence = *sequence;
    if concat.total == 0 || sequence == 0 || sequence > concat.total {
        return None;
    }
    let counterpart = match msg.kind {
        PduType::Deliver => msg.from.clone()?,
        PduType::Submit => msg.to.clone()?,
    };
    Some((
        BucketKey {
            kind: msg.kind,
            counterpart,
            reference: concat.reference,
            total: concat.total,
        },
        sequence,
    ))
}

/// Merges a whole listing. Single messages pass through untouched; each
/// concatenated group collapses onto the position of its first-seen
/// fragment; groups still incomplete when the listing ends are flushed
/// with `[?]` substituted for the missing parts.
pub(crate) fn merge_list(input: Vec<SmsMessage>) -> Vec<SmsMessage> {
    let mut out: Vec<Option<SmsMessage>> = Vec::with_capacity(input.len());
    let mut buckets: HashMap<BucketKey, (usize, Bucket)> = HashMap::new();
    for msg in input {
        let Some((key, sequence)) = fragment_key(&msg) else {
            out.push(Some(msg));
            continue;
        };
        let (slot, bucket) = match buckets.remove_entry(&key) {
            Some((_, v)) => v,
            None => {
                out.push(None);
                (out.len() - 1, Bucket::new(msg.clone(), key.total))
            }
        };
        let mut bucket = bucket;
        bucket.insert(sequence, msg.text, msg.index);
        if bucket.is_complete() {
            out[slot] = Some(bucket.finalize(&key));
        } else {
            buckets.insert(key, (slot, bucket));
        }
    }
    for (key, (slot, bucket)) in buckets {
        out[slot] = Some(bucket.finalize(&key));
    }
    out.into_iter().flatten().collect()
}

/// The live-receive bucket map. Fragments trickle in as the network
/// delivers them; a merged message pops out when the last one lands.
#[derive(Debug, Default)]
pub(crate) struct Reassembler {
    buckets: HashMap<BucketKey, Bucket>,
}

impl Reassembler {
    pub(crate) fn new() -> Self {
        Self::default()
    }
    /// Feeds one fragment. Returns the merged message once its group is
    /// complete, or the message itself if it is not concatenated at all.
    pub(crate) fn push(&mut self, msg: SmsMessage) -> Option<SmsMessage> {
        let Some((key, sequence)) = fragment_key(&msg) else {
            return Some(msg);
        };
        let bucket = self
            .buckets
            .entry(key.clone())
            .or_insert_with(|| Bucket::new(msg.clone(), key.total));
        bucket.insert(sequence, msg.text, msg.index);
        if bucket.is_complete() {
            let bucket = self.buckets.remove(&key).unwrap();
            Some(bucket.finalize(&key))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cmd::sms::MessageStatus;

    fn single(index: u32, text: &str) -> SmsMessage {
        SmsMessage {
            index,
            status: MessageStatus::ReceivedRead,
            kind: PduType::Deliver,
            from: Some("+8190000000000".into()),
            to: None,
            date: None,
            concat: None,
            text: text.into(),
        }
    }

    fn fragment(index: u32, reference: u16, total: u8, sequence: u8, text: &str) -> SmsMessage {
        let mut msg = single(index, text);
        msg.concat = Some(ConcatInfo {
            reference,
            total,
            state: ConcatState::Fragment { sequence },
        });
        msg
    }

    fn merged_indexes(msg: &SmsMessage) -> Vec<Option<u32>> {
        match &msg.concat.as_ref().unwrap().state {
            ConcatState::Merged { indexes } => indexes.clone(),
            other => panic!("expected merged concat state, got {:?}", other),
        }
    }

    #[test]
    fn singles_pass_through() {
        let out = merge_list(vec![single(1, "a"), single(2, "b")]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].text, "a");
    }

    #[test]
    fn out_of_order_fragments_merge_in_sequence_order() {
        let out = merge_list(vec![
            fragment(5, 17, 3, 2, "bbb"),
            fragment(4, 17, 3, 1, "aaa"),
            fragment(6, 17, 3, 3, "ccc"),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "aaabbbccc");
        // Identity comes from the first fragment encountered.
        assert_eq!(out[0].index, 5);
        assert_eq!(merged_indexes(&out[0]), vec![Some(4), Some(5), Some(6)]);
    }

    #[test]
    fn incomplete_group_flushes_with_placeholder() {
        let out = merge_list(vec![
            fragment(1, 9, 3, 1, "one"),
            fragment(2, 9, 3, 3, "three"),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "one[?]three");
        assert_eq!(merged_indexes(&out[0]), vec![Some(1), None, Some(2)]);
    }

    #[test]
    fn duplicate_sequence_overwrites_in_place() {
        let out = merge_list(vec![
            fragment(1, 9, 2, 1, "old"),
            fragment(3, 9, 2, 1, "new"),
            fragment(2, 9, 2, 2, "tail"),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].text, "newtail");
        assert_eq!(merged_indexes(&out[0]), vec![Some(3), Some(2)]);
    }

    #[test]
    fn groups_are_keyed_by_counterpart_and_reference() {
        let mut other = fragment(10, 17, 2, 1, "x");
        other.from = Some("+15550000000".into());
        let out = merge_list(vec![
            fragment(1, 17, 2, 1, "a"),
            other,
            fragment(2, 17, 2, 2, "b"),
        ]);
        // One merged pair plus one flushed singleton group.
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].text, "ab");
        assert_eq!(out[1].text, "x[?]");
    }

    #[test]
    fn list_order_keeps_first_seen_position() {
        let out = merge_list(vec![
            single(1, "first"),
            fragment(2, 5, 2, 1, "two-"),
            single(3, "middle"),
            fragment(4, 5, 2, 2, "parts"),
        ]);
        let texts: Vec<_> = out.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "two-parts", "middle"]);
    }

    #[test]
    fn live_mode_emits_only_on_completion() {
        let mut r = Reassembler::new();
        assert!(r.push(fragment(5, 17, 3, 2, "bbb")).is_none());
        assert!(r.push(fragment(4, 17, 3, 1, "aaa")).is_none());
        let merged = r.push(fragment(6, 17, 3, 3, "ccc")).unwrap();
        assert_eq!(merged.text, "aaabbbccc");
        assert_eq!(merged_indexes(&merged), vec![Some(4), Some(5), Some(6)]);
    }

    #[test]
    fn live_mode_passes_plain_messages_through() {
        let mut r = Reassembler::new();
        let msg = r.push(single(1, "plain")).unwrap();
        assert_eq!(msg.text, "plain");
        assert!(msg.concat.is_none());
    }
}
