//! Recovers the frame number of each decoded picture.
//!
//! Decoders emit pictures in presentation order while packets are sent in
//! decode order, so a picture's index cannot be counted from the packets.
//! After a seek the first packet sent is the keyframe whose index the table
//! of contents knows. Every later picture's index is that anchor index plus
//! the number of sent packets whose timestamp falls between the anchor and
//! the picture. Each output re-anchors on itself, so the history only keeps
//! timestamps not yet shown.

#[derive(Debug, Default)]
pub struct TimestampHistory {
    /// Presentation timestamps of sent packets not yet passed by an output.
    sent: Vec<i64>,
    anchor: Option<(i64, i64)>,
    /// Index of the first packet after a reset, until it arrives.
    pending: Option<i64>,
    last: i64,
}

impl TimestampHistory {
    pub fn new() -> Self {
        Self {
            last: -1,
            ..Self::default()
        }
    }

    /// Forget everything; the next packet sent is frame `index`.
    pub fn reset(&mut self, index: i64) {
        self.sent.clear();
        self.anchor = None;
        self.pending = Some(index);
        self.last = index - 1;
    }

    /// Record a packet handed to the decoder.
    pub fn on_sent(&mut self, pts: Option<i64>) {
        let Some(pts) = pts else {
            return;
        };
        if self.anchor.is_none() {
            if let Some(index) = self.pending.take() {
                self.anchor = Some((pts, index));
            }
        }
        let at = self.sent.partition_point(|p| *p <= pts);
        self.sent.insert(at, pts);
    }

    /// Frame number of an output picture with timestamp `pts`.
    pub fn index_of(&mut self, pts: Option<i64>) -> i64 {
        let index = match (pts, self.anchor) {
            (Some(q), Some((anchor_pts, anchor_index))) => {
                if q >= anchor_pts {
                    let lo = self.sent.partition_point(|p| *p < anchor_pts);
                    let hi = self.sent.partition_point(|p| *p < q);
                    anchor_index + (hi - lo) as i64
                } else {
                    let lo = self.sent.partition_point(|p| *p < q);
                    let hi = self.sent.partition_point(|p| *p < anchor_pts);
                    anchor_index - (hi - lo) as i64
                }
            }
            _ => self.last + 1,
        };

        if let Some(q) = pts {
            if self.anchor.is_some() {
                self.anchor = Some((q, index));
                let keep = self.sent.partition_point(|p| *p < q);
                self.sent.drain(..keep);
            }
        }
        self.last = index;
        index
    }

    /// Record an index found some other way, so counting continues from it.
    pub fn mark(&mut self, index: i64) {
        self.last = index;
    }

    pub fn last(&self) -> i64 {
        self.last
    }

    /// Timestamps awaiting output.
    pub fn pending_len(&self) -> usize {
        self.sent.len()
    }
}
