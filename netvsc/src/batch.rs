//! Send section batching.
//!
//! Small frames are copied back to back into one send section and handed to
//! the peer as a single packet. Each queue holds at most one such section
//! open at a time.

/// Where a data frame should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPlan {
    /// Copy the whole frame into the open section after its current content.
    Coalesce,
    /// Copy only the protocol header into the open section; the payload
    /// travels as page buffers. Sent right away.
    PartialCopy,
    /// Close the open section (if any) and copy the frame into a fresh one.
    FreshSection,
    /// Close the open section (if any) and send the frame from its own
    /// pages, without a section.
    Unbatched,
}

/// Section batching rules for one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlanner {
    pub section_size: u32,
    pub pkt_align: u32,
    pub max_batch: u32,
}

/// Fill state of a queue's open section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenSection {
    /// Bytes already copied, padding included.
    pub len: u32,
    /// Frames coalesced so far.
    pub count: u32,
}

impl BatchPlanner {
    pub fn new(section_size: u32, pkt_align: u32, max_batch: u32) -> Self {
        Self { section_size, pkt_align, max_batch }
    }

    /// Decide where a data frame of `pkt_len` bytes, `header_len` of them
    /// protocol header, should go.
    ///
    /// A partial copy is only chosen for frames too large for a section of
    /// their own; anything that fits whole gets a fresh section instead.
    pub fn plan(&self, open: Option<OpenSection>, pkt_len: usize, header_len: usize) -> BatchPlan {
        let section = self.section_size as usize;
        let align = self.pkt_align as usize;
        let fits_alone = pkt_len.saturating_add(align) < section;

        if let Some(open) = open.filter(|o| o.len > 0 && o.count < self.max_batch) {
            let used = open.len as usize;
            if used.saturating_add(pkt_len).saturating_add(align) < section {
                return BatchPlan::Coalesce;
            }
            if !fits_alone && used.saturating_add(header_len) < section {
                return BatchPlan::PartialCopy;
            }
        }

        if fits_alone {
            BatchPlan::FreshSection
        } else {
            BatchPlan::Unbatched
        }
    }

    /// Zero padding appended after a frame of `len` bytes.
    ///
    /// Only frames that will have a successor in the same section are
    /// padded.
    pub fn padding(&self, len: usize, more_coming: bool, partial: bool) -> u32 {
        let remain = (len % self.pkt_align as usize) as u32;
        if more_coming && !partial && remain != 0 {
            self.pkt_align - remain
        } else {
            0
        }
    }
}

/// Open section of one queue, waiting for more frames.
///
/// The section stays reserved in the slot map for as long as this exists.
#[derive(Debug)]
pub struct PendingBatch<B> {
    /// Reserved send section.
    pub slot: u32,
    /// Bytes copied into the section, padding included.
    pub len: u32,
    /// Frames coalesced into the section.
    pub count: u32,
    /// Buffer of the most recent frame. Earlier frames are already copied
    /// and their buffers released.
    pub owner: Option<B>,
}

impl<B> PendingBatch<B> {
    pub fn open_section(&self) -> OpenSection {
        OpenSection { len: self.len, count: self.count }
    }
}
