//! Intrusive doubly-linked list with O(1) push/pop/unlink.
//!
//! Nodes embed a [`ListLink`] and implement [`ListNode`]. The `Tag` type
//! parameter enables a single node to participate in multiple lists
//! simultaneously by using different tags for each link.
//!
//! The link records its owning list, so [`List::unlink`] removes a node from
//! the middle of a list in O(1) without a scan — this is what makes timer
//! cancellation cheap.
//!
//! # Safety
//!
//! This is an intrusive data structure using raw pointers. Callers must
//! ensure:
//! - Nodes outlive any list they're pushed to
//! - Nodes are not moved while linked
//! - A list is not moved while it has nodes (links point back at it)

use core::marker::PhantomData;
use core::ptr::NonNull;

/// Intrusive link embedded in list nodes.
///
/// Use different `Tag` types to allow a node to be in multiple lists.
#[derive(Debug)]
pub struct ListLink<T: ListNode<Tag>, Tag> {
    prev: Option<NonNull<T>>,
    next: Option<NonNull<T>>,
    /// Back-pointer to the list holding this node. `None` iff unlinked;
    /// unlike a bare `linked` flag it also lets `unlink` fix the owner's
    /// head/tail without being told which list the node is in.
    owner: Option<NonNull<List<T, Tag>>>,
    _tag: PhantomData<Tag>,
}

impl<T: ListNode<Tag>, Tag> ListLink<T, Tag> {
    pub const fn new() -> Self {
        Self {
            prev: None,
            next: None,
            owner: None,
            _tag: PhantomData,
        }
    }

    /// Returns `true` if this node is not in any list.
    #[inline]
    pub fn is_unlinked(&self) -> bool {
        self.owner.is_none()
    }

    /// The list currently holding this node, if any.
    #[inline]
    pub(crate) fn owner(&self) -> Option<NonNull<List<T, Tag>>> {
        self.owner
    }

    /// Internal: clear link state when removed.
    #[inline]
    fn clear(&mut self) {
        self.prev = None;
        self.next = None;
        self.owner = None;
    }
}

impl<T: ListNode<Tag>, Tag> Default for ListLink<T, Tag> {
    fn default() -> Self {
        Self::new()
    }
}

/// Trait for types that can be stored in a [`List`].
///
/// Implementors must provide access to an embedded [`ListLink`] field.
pub trait ListNode<Tag>: Sized {
    fn list_link(&mut self) -> &mut ListLink<Self, Tag>;
    fn list_link_ref(&self) -> &ListLink<Self, Tag>;
}

/// Intrusive doubly-linked FIFO list.
///
/// Uses `u32` length for 32/64-bit portability. Panics on overflow.
#[derive(Debug)]
pub struct List<T, Tag>
where
    T: ListNode<Tag>,
{
    head: Option<NonNull<T>>,
    tail: Option<NonNull<T>>,
    len: u32,
    _tag: PhantomData<Tag>,
}

impl<T, Tag> Default for List<T, Tag>
where
    T: ListNode<Tag>,
{
    fn default() -> Self {
        Self::init()
    }
}

impl<T, Tag> List<T, Tag>
where
    T: ListNode<Tag>,
{
    pub fn init() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            _tag: PhantomData,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        let empty = self.head.is_none();

        debug_assert!(empty == self.tail.is_none());
        debug_assert!(empty == (self.len == 0));

        empty
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Returns the head node without removing it.
    #[inline]
    pub fn front(&self) -> Option<NonNull<T>> {
        self.head
    }

    /// Add a node to the back of the list.
    ///
    /// # Panics
    /// - If `node` is already in a list (linked)
    /// - If list length would overflow `u32::MAX`
    pub fn push_back(&mut self, node: &mut T) {
        assert!(
            node.list_link_ref().is_unlinked(),
            "pushing already-linked node"
        );
        assert!(self.len < u32::MAX, "list length overflow");

        let self_ptr = NonNull::from(&mut *self);
        let node_ptr = NonNull::from(&mut *node);
        let old_tail = self.tail;

        {
            let link = node.list_link();
            link.prev = old_tail;
            link.next = None;
            link.owner = Some(self_ptr);
        }

        match old_tail {
            None => {
                debug_assert!(self.head.is_none());
                self.head = Some(node_ptr);
            }
            Some(mut tail_ptr) => {
                // SAFETY: tail is a live node of this list.
                unsafe {
                    let tail = tail_ptr.as_mut();
                    debug_assert!(tail.list_link_ref().next.is_none());
                    tail.list_link().next = Some(node_ptr);
                }
            }
        }

        self.tail = Some(node_ptr);
        self.len += 1;
    }

    /// Remove and return the front node, or `None` if empty.
    ///
    /// The returned node is unlinked and safe to re-push.
    pub fn pop_front(&mut self) -> Option<NonNull<T>> {
        let mut head_ptr = self.head?;

        debug_assert!(self.len > 0);

        // SAFETY: head is a live node of this list.
        let next = unsafe { head_ptr.as_ref().list_link_ref().next };
        self.head = next;

        match next {
            None => self.tail = None,
            Some(mut next_ptr) => {
                // SAFETY: a live node of this list.
                unsafe { next_ptr.as_mut().list_link().prev = None };
            }
        }

        self.len -= 1;

        // SAFETY: exclusive access; node no longer reachable from the list.
        unsafe { head_ptr.as_mut().list_link().clear() };

        Some(head_ptr)
    }

    /// Remove `node` from this list in O(1).
    ///
    /// # Panics
    /// If `node` is not linked into this list.
    pub fn unlink(&mut self, node: &mut T) {
        let self_ptr = NonNull::from(&mut *self);
        let node_ptr = NonNull::from(&mut *node);

        assert!(
            node.list_link_ref().owner() == Some(self_ptr),
            "unlinking node from a list it is not in"
        );
        debug_assert!(self.len > 0);

        let (prev, next) = {
            let link = node.list_link_ref();
            (link.prev, link.next)
        };

        match prev {
            None => {
                debug_assert!(self.head == Some(node_ptr));
                self.head = next;
            }
            // SAFETY: neighbors are live nodes of this list.
            Some(mut p) => unsafe { p.as_mut().list_link().next = next },
        }

        match next {
            None => {
                debug_assert!(self.tail == Some(node_ptr));
                self.tail = prev;
            }
            // SAFETY: neighbors are live nodes of this list.
            Some(mut n) => unsafe { n.as_mut().list_link().prev = prev },
        }

        self.len -= 1;
        node.list_link().clear();
    }

    /// O(n) search for `node`. Intended for debugging/assertions.
    pub fn contains(&self, node: &T) -> bool {
        let target = node as *const T;
        let mut current = self.head;
        let mut visited: u32 = 0;

        while let Some(ptr) = current {
            visited += 1;
            assert!(visited <= self.len, "cycle detected in list");

            if core::ptr::eq(ptr.as_ptr(), target) {
                return true;
            }

            // SAFETY: ptr is a live node of this list.
            current = unsafe { ptr.as_ref().list_link_ref().next };
        }

        false
    }

    /// Panic if internal invariants are violated. Debug builds only.
    #[cfg(debug_assertions)]
    pub fn check_invariants(&self) {
        if self.len == 0 {
            assert!(self.head.is_none(), "len=0 but head is Some");
            assert!(self.tail.is_none(), "len=0 but tail is Some");
            return;
        }

        assert!(self.head.is_some(), "len>0 but head is None");
        assert!(self.tail.is_some(), "len>0 but tail is None");

        let mut count: u32 = 0;
        let mut current = self.head;
        let mut prev: Option<NonNull<T>> = None;

        while let Some(ptr) = current {
            count += 1;
            assert!(count <= self.len, "more nodes than len indicates");

            // SAFETY: ptr is a live node of this list.
            let link = unsafe { ptr.as_ref().list_link_ref() };
            assert!(link.prev == prev, "prev pointer mismatch");
            let owner_ok = match link.owner() {
                Some(o) => core::ptr::eq(o.as_ptr(), self),
                None => false,
            };
            assert!(owner_ok, "node owned by a different list");

            prev = current;
            current = link.next;
        }

        assert!(count == self.len, "counted {} nodes, len is {}", count, self.len);
        assert!(prev == self.tail, "last node is not tail");
    }
}


#[cfg(all(test, feature = "stdx-proptest"))]
mod property_tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    const PROPTEST_CASES: u32 = 16;

    /// Full case budget on CI; a handful locally so `cargo test` stays quick.
    fn case_budget() -> u32 {
        if std::env::var_os("CI").is_some() {
            PROPTEST_CASES
        } else {
            PROPTEST_CASES.min(4)
        }
    }

    enum PTag {}

    #[derive(Default)]
    struct PNode {
        value: u32,
        link: ListLink<PNode, PTag>,
    }

    impl ListNode<PTag> for PNode {
        fn list_link(&mut self) -> &mut ListLink<Self, PTag> {
            &mut self.link
        }
        fn list_link_ref(&self) -> &ListLink<Self, PTag> {
            &self.link
        }
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Push(usize),
        Pop,
        Unlink(usize),
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(case_budget()))]

        /// The list matches a VecDeque model across pushes, pops, and
        /// unlinks of arbitrary elements.
        #[test]
        fn model(
            ops in prop::collection::vec(prop_oneof![
                (0usize..16).prop_map(Op::Push),
                Just(Op::Pop),
                (0usize..16).prop_map(Op::Unlink),
            ], 1..200)
        ) {
            let mut l: List<PNode, PTag> = List::init();
            let mut nodes: Vec<Box<PNode>> = (0..16)
                .map(|i| Box::new(PNode { value: i as u32, link: ListLink::new() }))
                .collect();
            let mut shadow: VecDeque<u32> = VecDeque::new();

            for op in ops {
                match op {
                    Op::Push(idx) => {
                        if nodes[idx].link.is_unlinked() {
                            l.push_back(&mut nodes[idx]);
                            shadow.push_back(idx as u32);
                        }
                    }
                    Op::Pop => {
                        match l.pop_front() {
                            Some(ptr) => {
                                let val = unsafe { ptr.as_ref().value };
                                prop_assert_eq!(Some(val), shadow.pop_front());
                            }
                            None => prop_assert!(shadow.is_empty()),
                        }
                    }
                    Op::Unlink(idx) => {
                        if !nodes[idx].link.is_unlinked() {
                            l.unlink(&mut nodes[idx]);
                            let pos = shadow.iter().position(|&v| v == idx as u32).unwrap();
                            shadow.remove(pos);
                        }
                    }
                }

                prop_assert_eq!(l.len() as usize, shadow.len());
                #[cfg(debug_assertions)]
                l.check_invariants();
            }

            // Drain and compare the final order.
            while let Some(ptr) = l.pop_front() {
                let val = unsafe { ptr.as_ref().value };
                prop_assert_eq!(Some(val), shadow.pop_front());
            }
            prop_assert!(shadow.is_empty());
        }
    }
}
