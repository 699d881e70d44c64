//! Grouping buffered fragments into resource-sized packets.

use stowage_core::Fragment;

/// How the packer groups fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackingStrategy {
    /// Greedy single pass in buffer order: start a new packet whenever the
    /// next fragment would overflow the limit. Keeps fragments that were
    /// written together adjacent, which is what defragmentation relies on.
    Filling,
    /// Best-fit decreasing into constant-volume bins. Produces fuller packets
    /// for mixed fragment sizes at the cost of reordering.
    BinPacking,
}

/// One planned resource payload. Fragments are kept in emission order; the
/// upload step derives each fragment's offset from that order.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    fragments: Vec<Fragment>,
    total_size: u64,
}

impl Packet {
    fn push(&mut self, fragment: Fragment) {
        self.total_size += fragment.size;
        self.fragments.push(fragment);
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}

/// Packs fragments into packets bounded by the backend's resource size.
#[derive(Debug, Clone, Copy)]
pub struct ResourcePacker {
    strategy: PackingStrategy,
}

impl ResourcePacker {
    pub fn new(strategy: PackingStrategy) -> Self {
        Self { strategy }
    }

    /// Group `fragments` into packets, each with a byte sum of at most
    /// `resource_size`. Packets are returned sorted by descending total size,
    /// so the fullest packet uploads first.
    ///
    /// Fragments larger than `resource_size` never enter the buffer; the
    /// fragment cache rejects them on add.
    pub fn pack(&self, resource_size: u64, fragments: &[Fragment]) -> Vec<Packet> {
        let mut packets = match self.strategy {
            PackingStrategy::Filling => Self::pack_filling(resource_size, fragments),
            PackingStrategy::BinPacking => Self::pack_best_fit(resource_size, fragments),
        };
        packets.sort_by(|a, b| b.total_size().cmp(&a.total_size()));
        packets
    }

    /// Whether any packet reaches `min_fill × resource_size`.
    pub fn any_packet_reaches_fill(
        &self,
        packets: &[Packet],
        resource_size: u64,
        min_fill: f64,
    ) -> bool {
        packets
            .iter()
            .any(|p| p.total_size() as f64 / resource_size as f64 >= min_fill)
    }

    fn pack_filling(resource_size: u64, fragments: &[Fragment]) -> Vec<Packet> {
        let mut packets = Vec::new();
        let mut current = Packet::default();
        for fragment in fragments {
            if !current.is_empty() && current.total_size() + fragment.size > resource_size {
                packets.push(std::mem::take(&mut current));
            }
            current.push(fragment.clone());
        }
        if !current.is_empty() {
            packets.push(current);
        }
        packets
    }

    fn pack_best_fit(resource_size: u64, fragments: &[Fragment]) -> Vec<Packet> {
        let mut sorted: Vec<&Fragment> = fragments.iter().collect();
        sorted.sort_by(|a, b| b.size.cmp(&a.size));

        let mut packets: Vec<Packet> = Vec::new();
        for fragment in sorted {
            // Tightest bin that still fits.
            let best = packets
                .iter_mut()
                .filter(|p| p.total_size() + fragment.size <= resource_size)
                .max_by_key(|p| p.total_size());
            match best {
                Some(packet) => packet.push(fragment.clone()),
                None => {
                    let mut packet = Packet::default();
                    packet.push(fragment.clone());
                    packets.push(packet);
                }
            }
        }
        packets
    }
}

impl Default for ResourcePacker {
    fn default() -> Self {
        Self::new(PackingStrategy::Filling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use stowage_core::FragmentHash;

    fn fragment(tag: u8, size: u64) -> Fragment {
        Fragment::new(FragmentHash::of(&[tag]), size, size)
    }

    #[test]
    fn test_filling_splits_on_overflow() {
        let packer = ResourcePacker::new(PackingStrategy::Filling);
        let fragments = vec![fragment(1, 4), fragment(2, 4), fragment(3, 4)];
        let packets = packer.pack(10, &fragments);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].total_size(), 8);
        assert_eq!(packets[1].total_size(), 4);
    }

    #[test]
    fn test_filling_preserves_buffer_order_within_packet() {
        let packer = ResourcePacker::new(PackingStrategy::Filling);
        let fragments = vec![fragment(1, 2), fragment(2, 2), fragment(3, 2)];
        let packets = packer.pack(100, &fragments);
        assert_eq!(packets.len(), 1);
        let hashes: Vec<_> = packets[0].fragments().iter().map(|f| f.hash).collect();
        assert_eq!(
            hashes,
            vec![fragments[0].hash, fragments[1].hash, fragments[2].hash]
        );
    }

    #[test]
    fn test_best_fit_fills_tightest_bin() {
        let packer = ResourcePacker::new(PackingStrategy::BinPacking);
        let fragments = vec![
            fragment(1, 6),
            fragment(2, 5),
            fragment(3, 4),
            fragment(4, 3),
        ];
        let packets = packer.pack(10, &fragments);
        // 6+4 and 5+3 fill two bins of 10.
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].total_size(), 10);
        assert_eq!(packets[1].total_size(), 8);
    }

    #[test]
    fn test_fill_predicate() {
        let packer = ResourcePacker::default();
        let packets = packer.pack(10, &[fragment(1, 9)]);
        assert!(packer.any_packet_reaches_fill(&packets, 10, 0.9));
        assert!(!packer.any_packet_reaches_fill(&packets, 10, 0.95));
    }

    proptest! {
        #[test]
        fn prop_no_packet_exceeds_resource_size(
            sizes in proptest::collection::vec(1u64..=64, 0..40),
            resource_size in 64u64..=256,
            bin_packing in any::<bool>(),
        ) {
            let fragments: Vec<Fragment> = sizes
                .iter()
                .enumerate()
                .map(|(i, s)| Fragment::new(FragmentHash::of(&[i as u8, *s as u8]), *s, *s))
                .collect();
            let strategy = if bin_packing {
                PackingStrategy::BinPacking
            } else {
                PackingStrategy::Filling
            };
            let packer = ResourcePacker::new(strategy);
            let packets = packer.pack(resource_size, &fragments);

            for packet in &packets {
                prop_assert!(packet.total_size() <= resource_size);
                prop_assert_eq!(
                    packet.total_size(),
                    packet.fragments().iter().map(|f| f.size).sum::<u64>()
                );
            }
            // Every fragment lands in exactly one packet.
            let packed: usize = packets.iter().map(|p| p.fragments().len()).sum();
            prop_assert_eq!(packed, fragments.len());
            // Sorted by descending total size.
            for pair in packets.windows(2) {
                prop_assert!(pair[0].total_size() >= pair[1].total_size());
            }
        }
    }
}
