//! Intrusive ordered map
//!
//! A key-ordered collection whose elements are allocated by the caller and
//! carry their own link node (an [`ItreeEntry`] field). Because the links
//! live inside the elements, the same element can be a member of several
//! collections at once through different link fields, and membership
//! changes never allocate.
//!
//! A tree is parameterized by an [`ItreeAdapter`], which names the key
//! field, the link field, and how to recover the element from its embedded
//! entry. Adapters are generated with [`itree_adapter!`].
//!
//! The balancing is a red-black tree following Cormen, Leiserson, Rivest,
//! Stein: the root is black, red nodes have black children, and every
//! root-to-nil path carries the same number of black nodes. All operations
//! are O(log n) worst case; `next`/`prev` are amortized O(1) over a full
//! traversal.
//!
//! The tree never owns its elements. Callers guarantee that an element
//! stays alive and does not move for as long as it is linked into a tree;
//! `insert`, `erase`, `next` and `prev` are `unsafe` for that reason.

use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr::NonNull;

/// Link node embedded in every tree element.
///
/// One `ItreeEntry` field per tree the element can belong to. An entry
/// records which tree currently holds it, so double insertion and foreign
/// erasure are caught by assertions.
pub struct ItreeEntry {
    up: Cell<Option<NonNull<ItreeEntry>>>,
    left: Cell<Option<NonNull<ItreeEntry>>>,
    right: Cell<Option<NonNull<ItreeEntry>>>,
    red: Cell<bool>,
    tree: Cell<*const ()>,
}

impl ItreeEntry {
    pub const fn new() -> Self {
        ItreeEntry {
            up: Cell::new(None),
            left: Cell::new(None),
            right: Cell::new(None),
            red: Cell::new(false),
            tree: Cell::new(core::ptr::null()),
        }
    }

    /// Whether this entry is currently linked into some tree.
    pub fn in_tree(&self) -> bool {
        !self.tree.get().is_null()
    }
}

impl Default for ItreeEntry {
    fn default() -> Self {
        Self::new()
    }
}

/// Glue between a tree and its element type: key selector, link selector,
/// and entry-to-element recovery.
///
/// # Safety
///
/// `entry` must always return the same field of the element, and `elem_of`
/// must be its exact inverse.
pub unsafe trait ItreeAdapter {
    type Elem;
    type Key: Ord + Copy;

    /// Read the element's key.
    fn key(elem: &Self::Elem) -> Self::Key;

    /// Select the embedded link this tree uses.
    fn entry(elem: &Self::Elem) -> &ItreeEntry;

    /// Recover the element from its embedded link.
    ///
    /// # Safety
    ///
    /// `entry` must be the field named by this adapter inside a live
    /// `Self::Elem`.
    unsafe fn elem_of(entry: NonNull<ItreeEntry>) -> NonNull<Self::Elem>;
}

/// Declare an [`ItreeAdapter`]: `itree_adapter!(pub AdapterName = Elem
/// { key: field: KeyType, link: link_field });`
#[macro_export]
macro_rules! itree_adapter {
    ($(#[$attr:meta])* $vis:vis $name:ident = $elem:ty {
        key: $key_field:ident: $key_ty:ty, link: $link_field:ident
    }) => {
        $(#[$attr])*
        $vis enum $name {}

        unsafe impl $crate::itree::ItreeAdapter for $name {
            type Elem = $elem;
            type Key = $key_ty;

            fn key(elem: &Self::Elem) -> Self::Key {
                elem.$key_field
            }

            fn entry(elem: &Self::Elem) -> &$crate::itree::ItreeEntry {
                &elem.$link_field
            }

            unsafe fn elem_of(
                entry: ::core::ptr::NonNull<$crate::itree::ItreeEntry>,
            ) -> ::core::ptr::NonNull<Self::Elem> {
                let off = ::core::mem::offset_of!($elem, $link_field);
                ::core::ptr::NonNull::new_unchecked(
                    entry.as_ptr().cast::<u8>().sub(off).cast::<$elem>(),
                )
            }
        }
    };
}

/// The intrusive red-black tree.
pub struct Itree<A: ItreeAdapter> {
    root: Cell<Option<NonNull<ItreeEntry>>>,
    len: Cell<usize>,
    _adapter: PhantomData<A>,
}

type Link = Option<NonNull<ItreeEntry>>;

// Entry-level navigation helpers. All of these dereference entries that are
// linked into a live tree, which the tree invariant keeps valid.

fn up(e: NonNull<ItreeEntry>) -> Link {
    unsafe { e.as_ref().up.get() }
}

fn left(e: NonNull<ItreeEntry>) -> Link {
    unsafe { e.as_ref().left.get() }
}

fn right(e: NonNull<ItreeEntry>) -> Link {
    unsafe { e.as_ref().right.get() }
}

fn set_up(e: NonNull<ItreeEntry>, v: Link) {
    unsafe { e.as_ref().up.set(v) }
}

fn set_left(e: NonNull<ItreeEntry>, v: Link) {
    unsafe { e.as_ref().left.set(v) }
}

fn set_right(e: NonNull<ItreeEntry>, v: Link) {
    unsafe { e.as_ref().right.set(v) }
}

fn is_red(e: NonNull<ItreeEntry>) -> bool {
    unsafe { e.as_ref().red.get() }
}

/// Nil nodes count as black.
fn is_black(e: Link) -> bool {
    e.map_or(true, |n| !is_red(n))
}

fn set_red(e: NonNull<ItreeEntry>, red: bool) {
    unsafe { e.as_ref().red.set(red) }
}

fn minimum(mut x: NonNull<ItreeEntry>) -> NonNull<ItreeEntry> {
    while let Some(l) = left(x) {
        x = l;
    }
    x
}

fn maximum(mut x: NonNull<ItreeEntry>) -> NonNull<ItreeEntry> {
    while let Some(r) = right(x) {
        x = r;
    }
    x
}

fn successor(x: NonNull<ItreeEntry>) -> Link {
    if let Some(r) = right(x) {
        return Some(minimum(r));
    }
    let mut x = x;
    let mut y = up(x);
    while let Some(p) = y {
        if right(p) != Some(x) {
            break;
        }
        x = p;
        y = up(p);
    }
    y
}

fn predecessor(x: NonNull<ItreeEntry>) -> Link {
    if let Some(l) = left(x) {
        return Some(maximum(l));
    }
    let mut x = x;
    let mut y = up(x);
    while let Some(p) = y {
        if left(p) != Some(x) {
            break;
        }
        x = p;
        y = up(p);
    }
    y
}

impl<A: ItreeAdapter> Itree<A> {
    pub const fn new() -> Self {
        Itree {
            root: Cell::new(None),
            len: Cell::new(0),
            _adapter: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len.get()
    }

    pub fn is_empty(&self) -> bool {
        self.len.get() == 0
    }

    fn key_of(e: NonNull<ItreeEntry>) -> A::Key {
        unsafe { A::key(A::elem_of(e).as_ref()) }
    }

    /// key(a) < key(b)
    fn less(a: NonNull<ItreeEntry>, b: NonNull<ItreeEntry>) -> bool {
        Self::key_of(a) < Self::key_of(b)
    }

    /// Redirect whatever pointer refers to `x` (parent's child slot or the
    /// root) to `v`. `x`'s own up link is left untouched.
    fn replace_child(&self, x: NonNull<ItreeEntry>, v: Link) {
        match up(x) {
            None => self.root.set(v),
            Some(p) => {
                if left(p) == Some(x) {
                    set_left(p, v);
                } else {
                    set_right(p, v);
                }
            }
        }
    }

    fn left_rotate(&self, x: NonNull<ItreeEntry>) {
        let y = right(x).expect("rotation pivot");
        set_right(x, left(y));
        if let Some(yl) = left(y) {
            set_up(yl, Some(x));
        }
        set_up(y, up(x));
        self.replace_child(x, Some(y));
        set_left(y, Some(x));
        set_up(x, Some(y));
    }

    fn right_rotate(&self, x: NonNull<ItreeEntry>) {
        let y = left(x).expect("rotation pivot");
        set_left(x, right(y));
        if let Some(yr) = right(y) {
            set_up(yr, Some(x));
        }
        set_up(y, up(x));
        self.replace_child(x, Some(y));
        set_right(y, Some(x));
        set_up(x, Some(y));
    }

    /// Link `elem` into the tree.
    ///
    /// # Safety
    ///
    /// `elem` must stay alive and pinned in memory until it is erased.
    /// It must not currently be in any tree through this link field
    /// (asserted).
    pub unsafe fn insert(&self, elem: NonNull<A::Elem>) {
        let z = NonNull::from(A::entry(elem.as_ref()));
        assert!(!z.as_ref().in_tree(), "element is already in a tree");

        let mut y: Link = None;
        let mut x = self.root.get();
        while let Some(n) = x {
            y = Some(n);
            x = if Self::less(z, n) { left(n) } else { right(n) };
        }
        set_up(z, y);
        match y {
            None => self.root.set(Some(z)),
            Some(p) => {
                if Self::less(z, p) {
                    set_left(p, Some(z));
                } else {
                    set_right(p, Some(z));
                }
            }
        }
        set_left(z, None);
        set_right(z, None);
        set_red(z, true);
        z.as_ref().tree.set(self as *const _ as *const ());
        self.len.set(self.len.get() + 1);
        self.insert_fixup(z);
    }

    fn insert_fixup(&self, mut z: NonNull<ItreeEntry>) {
        while let Some(p) = up(z) {
            if !is_red(p) {
                break;
            }
            // The root is never red, so a red parent has a parent.
            let pp = up(p).expect("red node at root");
            if left(pp) == Some(p) {
                let uncle = right(pp);
                if !is_black(uncle) {
                    set_red(p, false);
                    set_red(uncle.expect("red uncle"), false);
                    set_red(pp, true);
                    z = pp;
                } else {
                    let mut p = p;
                    if right(p) == Some(z) {
                        core::mem::swap(&mut z, &mut p);
                        self.left_rotate(z);
                    }
                    set_red(p, false);
                    set_red(pp, true);
                    self.right_rotate(pp);
                }
            } else {
                let uncle = left(pp);
                if !is_black(uncle) {
                    set_red(p, false);
                    set_red(uncle.expect("red uncle"), false);
                    set_red(pp, true);
                    z = pp;
                } else {
                    let mut p = p;
                    if left(p) == Some(z) {
                        core::mem::swap(&mut z, &mut p);
                        self.right_rotate(z);
                    }
                    set_red(p, false);
                    set_red(pp, true);
                    self.left_rotate(pp);
                }
            }
        }
        set_red(self.root.get().expect("insert left an empty tree"), false);
    }

    /// Replace the subtree rooted at `u` with the subtree rooted at `v`.
    fn transplant(&self, u: NonNull<ItreeEntry>, v: Link) {
        self.replace_child(u, v);
        if let Some(v) = v {
            set_up(v, up(u));
        }
    }

    /// Unlink `elem` from the tree.
    ///
    /// # Safety
    ///
    /// `elem` must be a live element currently in this tree (asserted).
    pub unsafe fn erase(&self, elem: NonNull<A::Elem>) {
        let z = NonNull::from(A::entry(elem.as_ref()));
        assert!(
            core::ptr::eq(z.as_ref().tree.get(), self as *const _ as *const ()),
            "element is not in this tree"
        );

        // x takes the removed node's structural place, xp is x's parent
        // (tracked separately because x may be nil).
        let mut xp = up(z);
        let x: Link;
        let mut removed_black = !is_red(z);

        if left(z).is_none() {
            x = right(z);
            self.transplant(z, x);
        } else if right(z).is_none() {
            x = left(z);
            self.transplant(z, x);
        } else {
            // y, z's in-order successor, takes z's place.
            let y = minimum(right(z).expect("checked above"));
            removed_black = !is_red(y);
            x = right(y);
            if right(z) != Some(y) {
                xp = up(y);
                self.transplant(y, x);
                set_right(y, right(z));
                set_up(right(y).expect("y replaces an inner node"), Some(y));
            } else {
                xp = Some(y);
            }
            self.transplant(z, Some(y));
            set_left(y, left(z));
            set_up(left(y).expect("z had two children"), Some(y));
            set_red(y, is_red(z));
        }

        let e = z.as_ref();
        e.tree.set(core::ptr::null());
        e.up.set(None);
        e.left.set(None);
        e.right.set(None);
        self.len.set(self.len.get() - 1);

        if removed_black {
            self.delete_fixup(x, xp);
        }
    }

    fn delete_fixup(&self, mut x: Link, mut xp: Link) {
        // x carries an extra blackness; push it up the tree.
        while let Some(p) = xp {
            if !is_black(x) {
                break;
            }
            if left(p) == x {
                // The sibling is not nil: black heights match x's side.
                let mut w = right(p).expect("sibling of a doubly-black node");
                if is_red(w) {
                    set_red(w, false);
                    set_red(p, true);
                    self.left_rotate(p);
                    w = right(p).expect("rotation preserved the sibling");
                }
                if is_black(left(w)) && is_black(right(w)) {
                    set_red(w, true);
                    x = Some(p);
                } else {
                    if is_black(right(w)) {
                        set_red(left(w).expect("red near child"), false);
                        set_red(w, true);
                        self.right_rotate(w);
                        w = right(p).expect("rotation preserved the sibling");
                    }
                    set_red(w, is_red(p));
                    set_red(p, false);
                    set_red(right(w).expect("red far child"), false);
                    self.left_rotate(p);
                    return;
                }
            } else {
                let mut w = left(p).expect("sibling of a doubly-black node");
                if is_red(w) {
                    set_red(w, false);
                    set_red(p, true);
                    self.right_rotate(p);
                    w = left(p).expect("rotation preserved the sibling");
                }
                if is_black(right(w)) && is_black(left(w)) {
                    set_red(w, true);
                    x = Some(p);
                } else {
                    if is_black(left(w)) {
                        set_red(right(w).expect("red near child"), false);
                        set_red(w, true);
                        self.left_rotate(w);
                        w = left(p).expect("rotation preserved the sibling");
                    }
                    set_red(w, is_red(p));
                    set_red(p, false);
                    set_red(left(w).expect("red far child"), false);
                    self.right_rotate(p);
                    return;
                }
            }
            xp = up(x.expect("x was just set to a real node"));
        }
        if let Some(x) = x {
            set_red(x, false);
        }
    }

    /// The element with key `key`, if present.
    pub fn find(&self, key: A::Key) -> Option<NonNull<A::Elem>> {
        let mut x = self.root.get();
        while let Some(n) = x {
            let nk = Self::key_of(n);
            if key < nk {
                x = left(n);
            } else if nk < key {
                x = right(n);
            } else {
                return Some(unsafe { A::elem_of(n) });
            }
        }
        None
    }

    /// Smallest element with key >= `key`.
    pub fn lower_bound(&self, key: A::Key) -> Option<NonNull<A::Elem>> {
        let mut best: Link = None;
        let mut x = self.root.get();
        while let Some(n) = x {
            if Self::key_of(n) >= key {
                best = Some(n);
                x = left(n);
            } else {
                x = right(n);
            }
        }
        best.map(|n| unsafe { A::elem_of(n) })
    }

    /// Smallest element with key > `key`.
    pub fn upper_bound(&self, key: A::Key) -> Option<NonNull<A::Elem>> {
        let mut best: Link = None;
        let mut x = self.root.get();
        while let Some(n) = x {
            if Self::key_of(n) > key {
                best = Some(n);
                x = left(n);
            } else {
                x = right(n);
            }
        }
        best.map(|n| unsafe { A::elem_of(n) })
    }

    /// Largest element with key <= `key`. Resolves an address to the
    /// region or pool that contains it.
    pub fn upper_bound_prev(&self, key: A::Key) -> Option<NonNull<A::Elem>> {
        let mut best: Link = None;
        let mut x = self.root.get();
        while let Some(n) = x {
            if Self::key_of(n) <= key {
                best = Some(n);
                x = right(n);
            } else {
                x = left(n);
            }
        }
        best.map(|n| unsafe { A::elem_of(n) })
    }

    /// Element with the smallest key.
    pub fn first(&self) -> Option<NonNull<A::Elem>> {
        self.root.get().map(|r| unsafe { A::elem_of(minimum(r)) })
    }

    /// Element with the largest key.
    pub fn last(&self) -> Option<NonNull<A::Elem>> {
        self.root.get().map(|r| unsafe { A::elem_of(maximum(r)) })
    }

    /// In-order successor of `elem`.
    ///
    /// # Safety
    ///
    /// `elem` must be a live element currently in this tree.
    pub unsafe fn next(&self, elem: NonNull<A::Elem>) -> Option<NonNull<A::Elem>> {
        let e = NonNull::from(A::entry(elem.as_ref()));
        debug_assert!(core::ptr::eq(
            e.as_ref().tree.get(),
            self as *const _ as *const ()
        ));
        successor(e).map(|n| A::elem_of(n))
    }

    /// In-order predecessor of `elem`.
    ///
    /// # Safety
    ///
    /// `elem` must be a live element currently in this tree.
    pub unsafe fn prev(&self, elem: NonNull<A::Elem>) -> Option<NonNull<A::Elem>> {
        let e = NonNull::from(A::entry(elem.as_ref()));
        debug_assert!(core::ptr::eq(
            e.as_ref().tree.get(),
            self as *const _ as *const ()
        ));
        predecessor(e).map(|n| A::elem_of(n))
    }

    /// Walk the whole structure and assert every red-black invariant:
    /// key order, red nodes with black children, equal black height on
    /// every path, consistent parent links, and the recorded size.
    pub fn check(&self) {
        let root = match self.root.get() {
            Some(r) => r,
            None => {
                assert_eq!(self.len.get(), 0);
                return;
            }
        };
        assert!(!is_red(root), "root is red");
        assert!(up(root).is_none());

        // Black height along the leftmost path, then demand it everywhere.
        let mut want = 0;
        let mut n = Some(root);
        while let Some(x) = n {
            if !is_red(x) {
                want += 1;
            }
            n = left(x);
        }
        let count = Self::check_node(root, 0, want);
        assert_eq!(count, self.len.get(), "size bookkeeping is off");
    }

    fn check_node(n: NonNull<ItreeEntry>, mut bh: usize, want: usize) -> usize {
        if !is_red(n) {
            bh += 1;
        }
        let mut count = 1;
        match left(n) {
            None => assert_eq!(bh, want, "black height mismatch"),
            Some(l) => {
                assert_eq!(up(l), Some(n), "broken parent link");
                assert!(!Self::less(n, l), "left child out of order");
                if is_red(n) {
                    assert!(!is_red(l), "red node has a red child");
                }
                count += Self::check_node(l, bh, want);
            }
        }
        match right(n) {
            None => assert_eq!(bh, want, "black height mismatch"),
            Some(r) => {
                assert_eq!(up(r), Some(n), "broken parent link");
                assert!(!Self::less(r, n), "right child out of order");
                if is_red(n) {
                    assert!(!is_red(r), "red node has a red child");
                }
                count += Self::check_node(r, bh, want);
            }
        }
        count
    }
}

impl<A: ItreeAdapter> Default for Itree<A> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    struct Node {
        key: u64,
        link: ItreeEntry,
        other_link: ItreeEntry,
    }

    impl Node {
        fn new(key: u64) -> Box<Node> {
            Box::new(Node {
                key,
                link: ItreeEntry::new(),
                other_link: ItreeEntry::new(),
            })
        }
    }

    itree_adapter!(ByKey = Node { key: key: u64, link: link });
    itree_adapter!(ByKeyAlt = Node { key: key: u64, link: other_link });

    fn keys_in_order(tree: &Itree<ByKey>) -> Vec<u64> {
        let mut out = Vec::new();
        let mut cur = tree.first();
        while let Some(n) = cur {
            out.push(unsafe { n.as_ref() }.key);
            cur = unsafe { tree.next(n) };
        }
        out
    }

    #[test]
    fn insert_find_erase() {
        let tree: Itree<ByKey> = Itree::new();
        let nodes: Vec<Box<Node>> = [5u64, 1, 9, 3, 7].iter().map(|&k| Node::new(k)).collect();
        for n in &nodes {
            unsafe { tree.insert(NonNull::from(&**n)) };
        }
        tree.check();
        assert_eq!(tree.len(), 5);
        assert_eq!(keys_in_order(&tree), vec![1, 3, 5, 7, 9]);

        assert_eq!(unsafe { tree.find(7).unwrap().as_ref() }.key, 7);
        assert!(tree.find(4).is_none());

        unsafe { tree.erase(NonNull::from(&*nodes[0])) };
        tree.check();
        assert_eq!(keys_in_order(&tree), vec![1, 3, 7, 9]);
        assert!(!nodes[0].link.in_tree());
    }

    #[test]
    fn bounds() {
        let tree: Itree<ByKey> = Itree::new();
        let nodes: Vec<Box<Node>> = [10u64, 20, 30].iter().map(|&k| Node::new(k)).collect();
        for n in &nodes {
            unsafe { tree.insert(NonNull::from(&**n)) };
        }

        let key = |n: Option<NonNull<Node>>| n.map(|n| unsafe { n.as_ref() }.key);
        assert_eq!(key(tree.lower_bound(15)), Some(20));
        assert_eq!(key(tree.lower_bound(20)), Some(20));
        assert_eq!(key(tree.upper_bound(20)), Some(30));
        assert_eq!(key(tree.upper_bound(30)), None);
        assert_eq!(key(tree.upper_bound_prev(25)), Some(20));
        assert_eq!(key(tree.upper_bound_prev(9)), None);
        assert_eq!(key(tree.upper_bound_prev(30)), Some(30));
    }

    #[test]
    fn two_trees_one_element() {
        let a: Itree<ByKey> = Itree::new();
        let b: Itree<ByKeyAlt> = Itree::new();
        let n = Node::new(42);
        unsafe {
            a.insert(NonNull::from(&*n));
            b.insert(NonNull::from(&*n));
        }
        assert!(n.link.in_tree());
        assert!(n.other_link.in_tree());
        unsafe { a.erase(NonNull::from(&*n)) };
        assert!(!n.link.in_tree());
        assert!(n.other_link.in_tree());
        unsafe { b.erase(NonNull::from(&*n)) };
    }

    #[test]
    fn range_walk() {
        let tree: Itree<ByKey> = Itree::new();
        let nodes: Vec<Box<Node>> = (0..10u64).map(|k| Node::new(k * 10)).collect();
        for n in &nodes {
            unsafe { tree.insert(NonNull::from(&**n)) };
        }
        // Everything in [25, 75] in key order.
        let mut got = Vec::new();
        let mut cur = tree.lower_bound(25);
        let end = tree.upper_bound(75);
        while cur != end {
            let n = cur.unwrap();
            got.push(unsafe { n.as_ref() }.key);
            cur = unsafe { tree.next(n) };
        }
        assert_eq!(got, vec![30, 40, 50, 60, 70]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        /// Any interleaving of inserts and erases keeps the structure a
        /// valid red-black tree whose traversal matches a model set.
        #[test]
        fn matches_model(ops in prop::collection::vec((any::<bool>(), 0u64..64), 1..200)) {
            let tree: Itree<ByKey> = Itree::new();
            let mut arena: Vec<Box<Node>> = Vec::new();
            let mut live: std::collections::BTreeMap<u64, usize> = Default::default();
            let mut model = BTreeSet::new();

            for (insert, key) in ops {
                if insert {
                    if model.insert(key) {
                        arena.push(Node::new(key));
                        let idx = arena.len() - 1;
                        live.insert(key, idx);
                        unsafe { tree.insert(NonNull::from(&*arena[idx])) };
                    }
                } else if model.remove(&key) {
                    let idx = live.remove(&key).unwrap();
                    unsafe { tree.erase(NonNull::from(&*arena[idx])) };
                }
                tree.check();
            }

            let expect: Vec<u64> = model.iter().copied().collect();
            prop_assert_eq!(keys_in_order(&tree), expect);
            prop_assert_eq!(tree.len(), model.len());
        }
    }
}
