//! Index-linked doubly linked list.
//!
//! The list header only stores the two ends; the `prev`/`next` links of each
//! element live wherever the owner keeps its elements (an array of sleep
//! blocks, or the headers of memory pool blocks). [`Links`] is the accessor
//! through which the list reaches them, so the same algorithm serves the
//! sleep list, the message FIFOs and the pool free lists.

/// Links to neighbor elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link<N> {
    pub prev: Option<N>,
    pub next: Option<N>,
}

impl<N> Link<N> {
    pub const UNLINKED: Self = Self {
        prev: None,
        next: None,
    };
}

/// Storage of the links of every element reachable through a list.
pub trait Links {
    /// Element identifier (an array index, a block address, ...).
    type Node: Copy + PartialEq;

    fn link(&self, node: Self::Node) -> Link<Self::Node>;
    fn set_link(&mut self, node: Self::Node, link: Link<Self::Node>);
}

/// List header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListHead<N> {
    first: Option<N>,
    last: Option<N>,
}

impl<N> ListHead<N> {
    pub const fn new() -> Self {
        Self {
            first: None,
            last: None,
        }
    }
}

impl<N: Copy + PartialEq> ListHead<N> {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    #[inline]
    pub fn first(&self) -> Option<N> {
        self.first
    }

    /// Append `node`, which must not be linked into any list.
    pub fn push_back<L: Links<Node = N>>(&mut self, links: &mut L, node: N) {
        links.set_link(
            node,
            Link {
                prev: self.last,
                next: None,
            },
        );
        match self.last {
            Some(last) => {
                let mut link = links.link(last);
                link.next = Some(node);
                links.set_link(last, link);
            }
            None => self.first = Some(node),
        }
        self.last = Some(node);
    }

    /// Unlink and return the first element.
    pub fn pop_front<L: Links<Node = N>>(&mut self, links: &mut L) -> Option<N> {
        let first = self.first?;
        self.remove(links, first);
        Some(first)
    }

    /// Unlink `node`, which must be an element of this list.
    pub fn remove<L: Links<Node = N>>(&mut self, links: &mut L, node: N) {
        let Link { prev, next } = links.link(node);

        match prev {
            Some(prev) => {
                let mut link = links.link(prev);
                link.next = next;
                links.set_link(prev, link);
            }
            None => {
                debug_assert!(self.first == Some(node), "node is not linked here");
                self.first = next;
            }
        }

        match next {
            Some(next) => {
                let mut link = links.link(next);
                link.prev = prev;
                links.set_link(next, link);
            }
            None => self.last = prev,
        }

        links.set_link(node, Link::UNLINKED);
    }

    /// Iterate over the elements from front to back. Elements may not be
    /// unlinked while the iterator is alive; use [`Self::next_of`] to walk
    /// and remove at the same time.
    pub fn iter<'a, L: Links<Node = N>>(&self, links: &'a L) -> Iter<'a, L> {
        Iter {
            links,
            next: self.first,
        }
    }

    /// The element following `node`.
    #[inline]
    pub fn next_of<L: Links<Node = N>>(&self, links: &L, node: N) -> Option<N> {
        links.link(node).next
    }
}

impl<N> Default for ListHead<N> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Iter<'a, L: Links> {
    links: &'a L,
    next: Option<L::Node>,
}

impl<L: Links> Iterator for Iter<'_, L> {
    type Item = L::Node;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next?;
        self.next = self.links.link(node).next;
        Some(node)
    }
}
