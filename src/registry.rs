use std::hash::Hash;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Decision returned by a [`LaneRegistry::update`] closure.
pub(crate) enum LaneUpdate<L> {
  /// Store this lane under the key (insert, or replace the current value).
  Install(L),
  /// Leave the entry as the closure left it through the `&mut` reference,
  /// or leave the key absent.
  Keep,
  /// Remove the entry. No-op when the key is absent.
  Remove,
}

/// The mapping from active sequence keys to their lanes.
///
/// All lane mutation goes through [`update`](Self::update), which runs its
/// closure while the per-key lock is held. Appends and sweeps for the same
/// key are therefore linearized: a sweep either observes the lane it armed on
/// (and may remove it) or a strict successor appended afterwards (and keeps
/// it). Closures must not block or await.
pub(crate) struct LaneRegistry<K, L> {
  map: Arc<DashMap<K, L>>,
}

impl<K, L> Clone for LaneRegistry<K, L> {
  fn clone(&self) -> Self {
    Self { map: self.map.clone() }
  }
}

impl<K, L> LaneRegistry<K, L>
where
  K: Hash + Eq,
{
  pub(crate) fn new() -> Self {
    Self {
      map: Arc::new(DashMap::new()),
    }
  }

  /// Atomic compute on one key: the closure observes the current lane (if
  /// any) and decides what the entry becomes. Returns whatever the closure
  /// produced alongside its decision.
  pub(crate) fn update<T>(&self, key: K, f: impl FnOnce(Option<&mut L>) -> (LaneUpdate<L>, T)) -> T {
    match self.map.entry(key) {
      Entry::Occupied(mut occupied) => {
        let (decision, out) = f(Some(occupied.get_mut()));
        match decision {
          LaneUpdate::Install(lane) => {
            occupied.insert(lane);
          }
          LaneUpdate::Keep => {}
          LaneUpdate::Remove => {
            occupied.remove();
          }
        }
        out
      }
      Entry::Vacant(vacant) => {
        let (decision, out) = f(None);
        if let LaneUpdate::Install(lane) = decision {
          vacant.insert(lane);
        }
        out
      }
    }
  }

  /// Number of currently active lanes.
  pub(crate) fn len(&self) -> usize {
    self.map.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn install_on_vacant_creates_entry() {
    let registry: LaneRegistry<&str, u32> = LaneRegistry::new();
    let created = registry.update("k", |slot| {
      assert!(slot.is_none());
      (LaneUpdate::Install(7), true)
    });
    assert!(created);
    assert_eq!(registry.len(), 1);
  }

  #[test]
  fn keep_mutates_in_place() {
    let registry: LaneRegistry<&str, u32> = LaneRegistry::new();
    registry.update("k", |_| (LaneUpdate::Install(1), ()));
    registry.update("k", |slot| {
      *slot.unwrap() += 1;
      (LaneUpdate::Keep, ())
    });
    let seen = registry.update("k", |slot| (LaneUpdate::Keep, *slot.unwrap()));
    assert_eq!(seen, 2);
    assert_eq!(registry.len(), 1);
  }

  #[test]
  fn remove_drops_entry_and_tolerates_absent_key() {
    let registry: LaneRegistry<&str, u32> = LaneRegistry::new();
    registry.update("k", |_| (LaneUpdate::Install(1), ()));
    registry.update("k", |_| (LaneUpdate::Remove, ()));
    assert_eq!(registry.len(), 0);
    // Second remove observes a vacant slot, as a sweep racing another sweep would.
    let was_present = registry.update("k", |slot| (LaneUpdate::Remove, slot.is_some()));
    assert!(!was_present);
  }

  #[test]
  fn install_replaces_existing_value() {
    let registry: LaneRegistry<&str, u32> = LaneRegistry::new();
    registry.update("k", |_| (LaneUpdate::Install(1), ()));
    registry.update("k", |_| (LaneUpdate::Install(2), ()));
    let seen = registry.update("k", |slot| (LaneUpdate::Keep, *slot.unwrap()));
    assert_eq!(seen, 2);
  }
}
