// SPDX-License-Identifier: BSD-3-Clause
//! Abstract memory and points-to model.
//!
//! Storage is an arena of [`Object`]s addressed by [`ObjectId`], so cyclic
//! data (a child pointing back at its parent) is just a pair of ids. Each
//! object is a flat vector of leaf cells, and a [`Location`] is an object
//! plus a leaf offset, which makes field accesses field-sensitive no matter
//! which pointer type reached them.
//!
//! Objects are reference counted so that forking a path copies only the
//! object table; an object is cloned the first time a path writes to it.

use std::collections::{BTreeSet, VecDeque};

use rustc_hash::FxHashSet;
use serde::Serialize;
use triomphe::Arc;

use crate::lattice::{Interval, Taint};

mod object;
pub use object::*;
pub mod value;
pub use value::{IntValue, PointerValue, Value};

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ObjectId(pub(crate) u32);

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An abstract location: a leaf of an object.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location {
    pub object: ObjectId,
    pub offset: usize,
}

impl Location {
    pub fn new(object: ObjectId, offset: usize) -> Self {
        Location { object, offset }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}+{}", self.object, self.offset)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("no object {0}")]
    NoSuchObject(ObjectId),
    #[error("access to {0} after its frame returned")]
    Dead(String),
    #[error("offset {offset} is outside of {object}")]
    OutOfBounds { object: String, offset: i128 },
}

#[derive(Clone, Debug, Default)]
pub struct Memory {
    objects: Vec<Arc<Object>>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, obj: Object) -> ObjectId {
        let id = ObjectId(self.objects.len() as u32);
        self.objects.push(Arc::new(obj));
        id
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn object(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(id.0 as usize).map(|o| &**o)
    }

    fn object_mut(&mut self, id: ObjectId) -> Result<&mut Object, MemoryError> {
        self.objects
            .get_mut(id.0 as usize)
            .map(Arc::make_mut)
            .ok_or(MemoryError::NoSuchObject(id))
    }

    /// Fill in an object allocated before its contents were known.
    pub fn set_cells(&mut self, id: ObjectId, cells: Vec<Value>) -> Result<(), MemoryError> {
        self.object_mut(id)?.set_cells(cells);
        Ok(())
    }

    pub fn kill(&mut self, id: ObjectId) -> Result<(), MemoryError> {
        self.object_mut(id)?.kill();
        Ok(())
    }

    fn live(&self, id: ObjectId) -> Result<&Object, MemoryError> {
        let obj = self.object(id).ok_or(MemoryError::NoSuchObject(id))?;
        if obj.is_alive() {
            Ok(obj)
        } else {
            Err(MemoryError::Dead(obj.name().to_string()))
        }
    }

    /// The location `delta` leaves past `loc`.
    pub fn displace(&self, loc: Location, delta: i128) -> Result<Location, MemoryError> {
        let obj = self.live(loc.object)?;
        let offset = loc.offset as i128 + delta;
        obj.cell_index(offset)
            .map(|idx| Location::new(loc.object, idx))
            .ok_or_else(|| MemoryError::OutOfBounds {
                object: obj.name().to_string(),
                offset,
            })
    }

    /// Every location `loc + stride * i` for `i` in `index` that lies inside
    /// the object, and whether some `i` fell outside of it.
    pub fn index_targets(
        &self,
        loc: Location,
        stride: usize,
        index: &Interval,
    ) -> Result<(BTreeSet<Location>, bool), MemoryError> {
        let obj = self.live(loc.object)?;
        let len = obj.len() as i128;
        let off = loc.offset as i128;
        let s = stride as i128;
        let mut out = BTreeSet::new();
        if s == 0 || len == 0 {
            out.extend(obj.cell_index(off).map(|i| Location::new(loc.object, i)));
            return Ok((out, false));
        }
        if obj.is_summarized() {
            if s % len == 0 {
                out.insert(Location::new(loc.object, off.rem_euclid(len) as usize));
            } else if index.width() >= len as u128 {
                out.extend((0..len as usize).map(|i| Location::new(loc.object, i)));
            } else {
                for i in index.lo()..=index.hi() {
                    let o = (off + s * i).rem_euclid(len) as usize;
                    out.insert(Location::new(loc.object, o));
                }
            }
            return Ok((out, false));
        }
        let first = -(off / s);
        let last = (len - 1 - off).div_euclid(s);
        let lo = index.lo().max(first);
        let hi = index.hi().min(last);
        let oob = index.lo() < first || index.hi() > last;
        if lo <= hi {
            for i in lo..=hi {
                out.insert(Location::new(loc.object, (off + s * i) as usize));
            }
        }
        Ok((out, oob))
    }

    pub fn read(&self, loc: Location) -> Result<&Value, MemoryError> {
        let obj = self.live(loc.object)?;
        obj.cells()
            .get(loc.offset)
            .ok_or_else(|| MemoryError::OutOfBounds {
                object: obj.name().to_string(),
                offset: loc.offset as i128,
            })
    }

    /// Whether a write to `loc` may replace its contents.
    pub fn is_strong(&self, loc: Location) -> bool {
        self.object(loc.object)
            .map(|o| !o.is_summarized())
            .unwrap_or(false)
    }

    /// Store `value` at `loc`. A weak write joins it with the old contents.
    pub fn write(&mut self, loc: Location, value: Value, strong: bool) -> Result<(), MemoryError> {
        self.live(loc.object)?;
        let strong = strong && self.is_strong(loc);
        let obj = self.object_mut(loc.object)?;
        let name = obj.name().to_string();
        let cell = obj.cell_mut(loc.offset).ok_or(MemoryError::OutOfBounds {
            object: name,
            offset: loc.offset as i128,
        })?;
        *cell = if strong { value } else { cell.join(&value) };
        Ok(())
    }

    /// Replace an unconstrained cell with a concrete stand-in for it. Unlike
    /// [`Memory::write`], this is strong even in summarized objects: the new
    /// value only names what the cell already held.
    pub fn materialize(&mut self, loc: Location, value: Value) -> Result<(), MemoryError> {
        let obj = self.object_mut(loc.object)?;
        let name = obj.name().to_string();
        let cell = obj.cell_mut(loc.offset).ok_or(MemoryError::OutOfBounds {
            object: name,
            offset: loc.offset as i128,
        })?;
        *cell = value;
        Ok(())
    }

    /// Join `t` into every cell of every live object. Stands in for a write
    /// whose targets are unknown.
    pub fn taint_all(&mut self, t: &Taint) {
        if !t.is_secret() {
            return;
        }
        for obj in &mut self.objects {
            let stale = obj.is_alive()
                && obj
                    .cells()
                    .iter()
                    .any(|c| !t.sources().is_subset(c.taint().sources()));
            if stale {
                let cells = obj.cells().iter().map(|c| c.clone().taint_with(t)).collect();
                Arc::make_mut(obj).set_cells(cells);
            }
        }
    }

    pub fn describe(&self, loc: Location) -> String {
        match self.object(loc.object) {
            Some(o) => format!("{}+{}", o.name(), loc.offset),
            None => loc.to_string(),
        }
    }

    /// Join of the taints of every cell reachable from `roots`.
    pub fn reachable_taint(&self, roots: impl IntoIterator<Item = Location>) -> Taint {
        let mut taint = Taint::public();
        self.walk(roots, |cell| {
            taint.absorb(&cell.taint());
            false
        });
        taint
    }

    /// Whether any cell reachable from `roots` holds secret data.
    pub fn reaches_secret(&self, roots: impl IntoIterator<Item = Location>) -> bool {
        self.walk(roots, Value::is_secret)
    }

    /// Visit the cells of every object reachable from `roots` until `stop`
    /// returns true.
    fn walk(
        &self,
        roots: impl IntoIterator<Item = Location>,
        mut stop: impl FnMut(&Value) -> bool,
    ) -> bool {
        let mut seen = FxHashSet::default();
        let mut queue: VecDeque<ObjectId> = roots.into_iter().map(|l| l.object).collect();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            let obj = match self.object(id) {
                Some(o) => o,
                None => continue,
            };
            for cell in obj.cells() {
                if stop(cell) {
                    return true;
                }
                if let Value::Ptr(p) = cell {
                    queue.extend(p.targets.iter().map(|l| l.object));
                }
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ints(n: usize) -> Vec<Value> {
        (0..n)
            .map(|i| Value::Int(IntValue::constant(32, i as i128)))
            .collect()
    }

    #[test]
    fn index_clamps_to_bounds() {
        let mut mem = Memory::new();
        let id = mem.allocate(Object::new("z".to_string(), Region::Stack, ints(3)));
        let base = Location::new(id, 0);
        let (ts, oob) = mem
            .index_targets(base, 1, &Interval::new(0, 2).unwrap())
            .unwrap();
        assert_eq!(3, ts.len());
        assert!(!oob);
        let (ts, oob) = mem
            .index_targets(base, 1, &Interval::new(2, 10).unwrap())
            .unwrap();
        assert_eq!(BTreeSet::from([Location::new(id, 2)]), ts);
        assert!(oob);
        let (ts, oob) = mem.index_targets(base, 1, &Interval::exact(7)).unwrap();
        assert!(ts.is_empty());
        assert!(oob);
    }

    #[test]
    fn summarized_objects_wrap() {
        let mut mem = Memory::new();
        let id = mem.allocate(Object::summarized(
            "a[*]".to_string(),
            Region::Input,
            ints(2),
        ));
        let base = Location::new(id, 1);
        let (ts, oob) = mem.index_targets(base, 2, &Interval::exact(1000)).unwrap();
        assert_eq!(BTreeSet::from([Location::new(id, 1)]), ts);
        assert!(!oob);
        assert_eq!(Location::new(id, 0), mem.displace(base, 3).unwrap());
    }

    #[test]
    fn weak_writes_join() {
        let mut mem = Memory::new();
        let id = mem.allocate(Object::summarized(
            "a[*]".to_string(),
            Region::Input,
            ints(1),
        ));
        let loc = Location::new(id, 0);
        let secret = Value::Int(IntValue::unconstrained(32, Taint::secret("k")));
        mem.write(loc, secret, true).unwrap();
        assert!(mem.read(loc).unwrap().is_secret());
        assert!(mem.reaches_secret([loc]));
        assert_eq!(Taint::secret("k"), mem.reachable_taint([loc]));
    }

    #[test]
    fn taint_all_keeps_pointers_and_dead_objects() {
        let mut mem = Memory::new();
        let x = mem.allocate(Object::new("x".to_string(), Region::Stack, ints(2)));
        let dead = mem.allocate(Object::new("d".to_string(), Region::Stack, ints(1)));
        let p = Value::Ptr(PointerValue::to(Location::new(x, 1)));
        let y = mem.allocate(Object::new("y".to_string(), Region::Lazy, vec![p]));
        mem.kill(dead).unwrap();
        let before = mem.clone();

        mem.taint_all(&Taint::secret("k"));
        assert!(mem.read(Location::new(x, 0)).unwrap().is_secret());
        match mem.read(Location::new(y, 0)).unwrap() {
            Value::Ptr(p) => {
                assert!(p.taint.is_secret());
                assert_eq!(BTreeSet::from([Location::new(x, 1)]), p.targets);
                assert!(!p.maybe_null);
            }
            v => panic!("unexpected cell {}", v),
        }
        assert!(!mem.object(dead).unwrap().cells()[0].is_secret());
        assert!(!before.reaches_secret([Location::new(y, 0)]));
    }

    #[test]
    fn forks_do_not_share_writes() {
        let mut mem = Memory::new();
        let id = mem.allocate(Object::new("x".to_string(), Region::Stack, ints(1)));
        let loc = Location::new(id, 0);
        let mut fork = mem.clone();
        fork.write(loc, Value::Int(IntValue::constant(32, 9)), true)
            .unwrap();
        assert_eq!(&Value::Int(IntValue::constant(32, 0)), mem.read(loc).unwrap());
        fork.kill(id).unwrap();
        assert!(matches!(fork.read(loc), Err(MemoryError::Dead(_))));
        assert!(mem.read(loc).is_ok());
    }
}
