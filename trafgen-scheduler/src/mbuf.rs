use std::sync::Arc;

use crate::node::StreamNode;

/// An outgoing packet: a head segment and an optional shared read-only tail.
///
/// Constant streams hand out clones of one `Mbuf`, so every packet points at
/// the same bytes. VM streams get a fresh head per packet while the tail is
/// shared by every instance of the stream.
#[derive(Debug, Clone)]
pub struct Mbuf {
    head: Arc<[u8]>,
    tail: Option<Arc<[u8]>>,
    pkt_len: usize,
}

impl Mbuf {
    pub fn new(head: Arc<[u8]>) -> Self {
        let pkt_len = head.len();
        Self {
            head,
            tail: None,
            pkt_len,
        }
    }

    /// Chain `tail` behind `head`. The packet is cut at `pkt_len` bytes.
    pub fn chained(head: Arc<[u8]>, tail: Option<Arc<[u8]>>, pkt_len: usize) -> Self {
        let total = head.len() + tail.as_ref().map_or(0, |t| t.len());
        Self {
            head,
            tail,
            pkt_len: pkt_len.min(total),
        }
    }

    pub fn len(&self) -> usize {
        self.pkt_len
    }
    pub fn is_empty(&self) -> bool {
        self.pkt_len == 0
    }
    pub fn head(&self) -> &Arc<[u8]> {
        &self.head
    }
    pub fn tail(&self) -> Option<&Arc<[u8]>> {
        self.tail.as_ref()
    }

    /// Wire bytes, segment by segment.
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> {
        let head_len = self.head.len().min(self.pkt_len);
        let tail_len = self.pkt_len - head_len;
        std::iter::once(&self.head[..head_len]).chain(
            self.tail
                .as_deref()
                .map(|t| &t[..tail_len])
                .filter(|t| !t.is_empty()),
        )
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.segments().flatten().copied().collect()
    }

    /// Whether both buffers share the same head allocation.
    pub fn ptr_eq(&self, other: &Mbuf) -> bool {
        Arc::ptr_eq(&self.head, &other.head)
    }
}

/// Where fired packets go; the NIC send capability of the surrounding core.
/// `node` is the stream that fired, its port and time are those of the packet.
pub trait PacketSink {
    fn send_node(&mut self, node: &StreamNode, mbuf: Mbuf);
}

impl<F: FnMut(&StreamNode, Mbuf)> PacketSink for F {
    fn send_node(&mut self, node: &StreamNode, mbuf: Mbuf) {
        self(node, mbuf)
    }
}
