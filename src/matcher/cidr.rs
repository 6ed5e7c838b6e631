use std::net::IpAddr;

use ipnet::IpNet;

#[derive(Debug, Clone)]
struct BitNode<V> {
    child: [Option<u32>; 2],
    mark: Option<V>,
}

impl<V> BitNode<V> {
    fn empty() -> Self {
        Self {
            child: [None, None],
            mark: None,
        }
    }
}

/// Arena-backed binary trie over the big-endian bits of one address family.
#[derive(Debug, Clone)]
struct BitTrie<V> {
    nodes: Vec<BitNode<V>>,
    width: u32,
}

impl<V> BitTrie<V> {
    fn new(width: u32) -> Self {
        Self {
            nodes: vec![BitNode::empty()],
            width,
        }
    }

    fn bit(&self, bits: u128, depth: u32) -> usize {
        ((bits >> (self.width - 1 - depth)) & 1) as usize
    }

    fn insert(&mut self, bits: u128, prefix_len: u32, mark: V) {
        let mut idx = 0usize;
        for depth in 0..prefix_len.min(self.width) {
            let b = self.bit(bits, depth);
            idx = match self.nodes[idx].child[b] {
                Some(next) => next as usize,
                None => {
                    let next = self.nodes.len();
                    self.nodes.push(BitNode::empty());
                    self.nodes[idx].child[b] = Some(next as u32);
                    next
                }
            };
        }
        self.nodes[idx].mark = Some(mark);
    }

    /// Last terminal crossed on the path wins, which is the longest matching prefix.
    fn search(&self, bits: u128) -> Option<&V> {
        let mut idx = 0usize;
        let mut best = self.nodes[0].mark.as_ref();
        for depth in 0..self.width {
            let b = self.bit(bits, depth);
            match self.nodes[idx].child[b] {
                Some(next) => idx = next as usize,
                None => break,
            }
            if let Some(mark) = self.nodes[idx].mark.as_ref() {
                best = Some(mark);
            }
        }
        best
    }
}

#[derive(Debug, Clone)]
pub struct CidrTrie<V> {
    v4: BitTrie<V>,
    v6: BitTrie<V>,
    len: usize,
}

impl<V> Default for CidrTrie<V> {
    fn default() -> Self {
        Self {
            v4: BitTrie::new(32),
            v6: BitTrie::new(128),
            len: 0,
        }
    }
}

impl<V> CidrTrie<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, net: IpNet, mark: V) {
        let net = net.trunc();
        match net {
            IpNet::V4(n) => self.v4.insert(
                u32::from(n.network()) as u128,
                n.prefix_len() as u32,
                mark,
            ),
            IpNet::V6(n) => self
                .v6
                .insert(u128::from(n.network()), n.prefix_len() as u32, mark),
        }
        self.len += 1;
    }

    pub fn search(&self, ip: IpAddr) -> Option<&V> {
        match ip {
            IpAddr::V4(v4) => self.v4.search(u32::from(v4) as u128),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => self.v4.search(u32::from(v4) as u128),
                None => self.v6.search(u128::from(v6)),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn longest_prefix_wins_regardless_of_insert_order() {
        let mut t = CidrTrie::new();
        t.insert(net("10.0.0.0/8"), "wide");
        t.insert(net("10.1.0.0/16"), "narrow");
        assert_eq!(t.search(ip("10.1.2.3")), Some(&"narrow"));
        assert_eq!(t.search(ip("10.2.0.1")), Some(&"wide"));

        let mut r = CidrTrie::new();
        r.insert(net("10.1.0.0/16"), "narrow");
        r.insert(net("10.0.0.0/8"), "wide");
        assert_eq!(r.search(ip("10.1.2.3")), Some(&"narrow"));
    }

    #[test]
    fn same_prefix_later_insert_wins() {
        let mut t = CidrTrie::new();
        t.insert(net("192.168.0.0/16"), 1);
        t.insert(net("192.168.0.0/16"), 2);
        assert_eq!(t.search(ip("192.168.1.1")), Some(&2));
    }

    #[test]
    fn families_are_separate_and_mapped_v4_uses_v4_tree() {
        let mut t = CidrTrie::new();
        t.insert(net("127.0.0.0/8"), "v4");
        t.insert(net("fc00::/7"), "v6");
        assert_eq!(t.search(ip("::ffff:127.0.0.1")), Some(&"v4"));
        assert_eq!(t.search(ip("fd00::1")), Some(&"v6"));
        assert_eq!(t.search(ip("2001:db8::1")), None);
        assert_eq!(t.search(ip("8.8.8.8")), None);
    }

    #[test]
    fn host_bits_are_masked_and_default_route_matches_all() {
        let mut t = CidrTrie::new();
        t.insert(net("10.2.0.1/24"), "fake");
        t.insert(net("0.0.0.0/0"), "any");
        assert_eq!(t.search(ip("10.2.0.200")), Some(&"fake"));
        assert_eq!(t.search(ip("1.1.1.1")), Some(&"any"));
        assert_eq!(t.search(ip("10.2.0.200")).copied(), Some("fake"));
    }

    #[test]
    fn full_length_prefix_matches_single_address() {
        let mut t = CidrTrie::new();
        t.insert(net("1.2.3.4/32"), ());
        assert!(t.search(ip("1.2.3.4")).is_some());
        assert!(t.search(ip("1.2.3.5")).is_none());
        assert_eq!(t.len(), 1);
    }
}
