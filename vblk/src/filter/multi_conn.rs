//! Multi-connection consistency coordinator.
//!
//! Clients assume that after one connection's flush returns, writes
//! from *all* connections are durable.  Backends that cannot promise
//! this get it emulated here: connections are grouped (globally, or
//! by export name), each handle tracks a read/write dirty mask, and a
//! flush on any handle flushes every handle in the group whose mask
//! demands it.
//!
//! Modes: `auto` resolves to `plugin` (pass through, the backend is
//! already consistent) or `emulate` from the backend's own answer;
//! `disable` hides multi-conn support entirely; `unsafe` advertises
//! it without doing anything, for clients known not to need it.

use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use crate::backend::{Backend, Flags, FuaCapability, Next};
use crate::filter::forward_backend;
use crate::{Error, Result};

/// Dirty-mask bit: a write may be sitting in a cache somewhere.
const DIRTY_WRITE: u8 = 1;
/// Dirty-mask bit: a read may have populated a cache.
const DIRTY_READ: u8 = 2;

/// Coordination mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MultiConnMode {
    /// Resolve to `Plugin` or `Emulate` from the backend's answer.
    #[default]
    Auto,
    /// Emulate consistency by flushing the whole group.
    Emulate,
    /// Trust the backend's native consistency.
    Plugin,
    /// Never advertise multi-conn.
    Disable,
    /// Advertise multi-conn without enforcing anything.
    Unsafe,
}

impl FromStr for MultiConnMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(Self::Auto),
            "emulate" => Ok(Self::Emulate),
            "plugin" => Ok(Self::Plugin),
            "disable" => Ok(Self::Disable),
            "unsafe" => Ok(Self::Unsafe),
            _ => Err(Error::invalid(format!("unknown multi-conn mode {s:?}"))),
        }
    }
}

/// How precisely dirtiness is tracked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TrackDirtyMode {
    /// Per connection: reads and writes both tracked.
    #[default]
    Conn,
    /// Per group: any write dirties the group.
    Fast,
    /// Not tracked: every flush flushes.
    Off,
}

impl FromStr for TrackDirtyMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "conn" | "connection" => Ok(Self::Conn),
            "fast" => Ok(Self::Fast),
            "off" => Ok(Self::Off),
            _ => Err(Error::invalid(format!("unknown multi-conn track-dirty setting {s:?}"))),
        }
    }
}

/// Configuration for the coordinator.
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiConnConfig {
    /// Coordination mode.
    pub mode: MultiConnMode,
    /// Dirty tracking granularity.
    pub track_dirty: TrackDirtyMode,
    /// Group connections by export name instead of globally.
    pub by_export_name: bool,
}

/// One connection's shared state within its group.
#[derive(Debug)]
struct HandleState {
    /// The connection's own chain.
    next: Next,
    /// Mask of [`DIRTY_WRITE`] and [`DIRTY_READ`].
    dirty: AtomicU8,
}

/// A group of connections flushed together.
#[derive(Debug)]
struct Group {
    /// Export name the group serves (empty when grouping globally).
    name: String,
    /// Member connections.
    conns: Mutex<Vec<Arc<HandleState>>>,
    /// Whether any member may be dirty.
    dirty: AtomicU8,
}

/// Groups connections and builds per-connection filters.
#[derive(Debug)]
pub struct MultiConnCoordinator {
    /// Configuration shared by every handle.
    config: MultiConnConfig,
    /// All live groups.
    groups: Mutex<Vec<Arc<Group>>>,
}

impl MultiConnCoordinator {
    /// Creates an empty coordinator.
    pub fn new(config: MultiConnConfig) -> Arc<Self> {
        Arc::new(Self { config, groups: Mutex::new(Vec::new()) })
    }

    /// Opens one connection's filter over its chain.
    pub fn open(self: &Arc<Self>, next: Next, export_name: &str) -> MultiConnFilter {
        MultiConnFilter {
            coordinator: Arc::clone(self),
            next: Arc::clone(&next),
            state: Arc::new(HandleState { next, dirty: AtomicU8::new(0) }),
            export_name: if self.config.by_export_name {
                export_name.to_owned()
            } else {
                String::new()
            },
            mode: OnceLock::new(),
            group: Mutex::new(None),
        }
    }

    /// Finds or creates the group for `name`.
    fn group(&self, name: &str) -> Arc<Group> {
        let mut groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(g) = groups.iter().find(|g| g.name == name) {
            return Arc::clone(g);
        }
        let g = Arc::new(Group {
            name: name.to_owned(),
            conns: Mutex::new(Vec::new()),
            dirty: AtomicU8::new(0),
        });
        groups.push(Arc::clone(&g));
        g
    }

    /// Drops `group` if it has no members left.
    fn release(&self, group: &Arc<Group>) {
        let mut groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
        if group.conns.lock().unwrap_or_else(PoisonError::into_inner).is_empty() {
            groups.retain(|g| !Arc::ptr_eq(g, group));
        }
    }
}

/// One connection's view of the coordinator.
#[derive(Debug)]
pub struct MultiConnFilter {
    /// The shared coordinator.
    coordinator: Arc<MultiConnCoordinator>,
    /// The connection's chain (the same backend `state` refers to).
    next: Next,
    /// This connection's state.
    state: Arc<HandleState>,
    /// Group key.
    export_name: String,
    /// `Auto` resolved at prepare time.
    mode: OnceLock<MultiConnMode>,
    /// The group joined at prepare time.
    group: Mutex<Option<Arc<Group>>>,
}

impl MultiConnFilter {
    /// The resolved mode (after prepare).
    fn mode(&self) -> MultiConnMode {
        self.mode.get().copied().unwrap_or(self.coordinator.config.mode)
    }

    /// Marks this connection dirty after an I/O operation.
    fn mark_dirty(&self, is_write: bool) {
        // No lock needed: a client must wait for its flush response
        // before issuing commands that rely on it, so races here trace
        // back to protocol misuse.
        let track = self.coordinator.config.track_dirty;
        match track {
            TrackDirtyMode::Conn | TrackDirtyMode::Fast => {
                if track == TrackDirtyMode::Conn {
                    let bit = if is_write { DIRTY_WRITE } else { DIRTY_READ };
                    self.state.dirty.fetch_or(bit, Ordering::Relaxed);
                }
                if is_write
                    && let Some(group) = &*self.group.lock().unwrap_or_else(PoisonError::into_inner)
                {
                    group.dirty.store(1, Ordering::Relaxed);
                }
            }
            TrackDirtyMode::Off => {}
        }
    }
}

impl Backend for MultiConnFilter {
    fn name(&self) -> &'static str {
        "multi-conn"
    }

    forward_backend!(
        next: preconnect, get_size,
        block_size,
        list_exports,
        default_export,
        thread_model,
        can_write,
        can_flush,
        can_trim,
        can_zero,
        can_fast_zero,
        can_extents,
        can_cache,
        extents,
    );

    fn prepare(&self, readonly: bool) -> Result<()> {
        self.state.next.prepare(readonly)?;

        // Resolve auto mode from the backend.
        let resolved = match self.coordinator.config.mode {
            MultiConnMode::Auto => {
                if self.state.next.can_multi_conn()? {
                    MultiConnMode::Plugin
                } else {
                    MultiConnMode::Emulate
                }
            }
            other => other,
        };
        if resolved == MultiConnMode::Emulate && !self.state.next.can_flush()? {
            return Err(Error::invalid("emulating multi-conn requires working flush"));
        }
        let _ = self.mode.set(resolved);

        // Join the group.
        let group = self.coordinator.group(&self.export_name);
        group
            .conns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&self.state));
        *self.group.lock().unwrap_or_else(PoisonError::into_inner) = Some(group);
        Ok(())
    }

    fn finalize(&self) -> Result<()> {
        if let Some(group) = self.group.lock().unwrap_or_else(PoisonError::into_inner).take() {
            group
                .conns
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|h| !Arc::ptr_eq(h, &self.state));
            self.coordinator.release(&group);
        }
        self.state.next.finalize()
    }

    fn can_fua(&self) -> Result<FuaCapability> {
        // With native FUA but emulated multi-conn we would have to
        // flush the whole group anyway, so advertise emulated FUA.
        let fua = self.state.next.can_fua()?;
        if fua == FuaCapability::Native && self.mode() == MultiConnMode::Emulate {
            return Ok(FuaCapability::Emulate);
        }
        Ok(fua)
    }

    fn can_multi_conn(&self) -> Result<bool> {
        match self.mode() {
            MultiConnMode::Emulate | MultiConnMode::Unsafe => Ok(true),
            MultiConnMode::Plugin => self.state.next.can_multi_conn(),
            MultiConnMode::Disable => Ok(false),
            MultiConnMode::Auto => Ok(false), // resolved in prepare
        }
    }

    fn pread(&self, buf: &mut [u8], offset: u64, flags: Flags) -> Result<()> {
        self.mark_dirty(false);
        self.state.next.pread(buf, offset, flags)
    }

    fn pwrite(&self, buf: &[u8], offset: u64, flags: Flags) -> Result<()> {
        self.mark_dirty(true);
        self.state.next.pwrite(buf, offset, flags)
    }

    fn trim(&self, count: u32, offset: u64, flags: Flags) -> Result<()> {
        self.mark_dirty(true);
        self.state.next.trim(count, offset, flags)
    }

    fn zero(&self, count: u32, offset: u64, flags: Flags) -> Result<()> {
        self.mark_dirty(true);
        self.state.next.zero(count, offset, flags)
    }

    fn cache(&self, count: u32, offset: u64, flags: Flags) -> Result<()> {
        self.mark_dirty(false);
        self.state.next.cache(count, offset, flags)
    }

    fn flush(&self, flags: Flags) -> Result<()> {
        let track = self.coordinator.config.track_dirty;
        let group = self.group.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(group) = group.as_ref() else {
            return self.state.next.flush(flags);
        };

        if self.mode() == MultiConnMode::Emulate {
            // Flush every member whose dirty mask demands it, then
            // clear the masks.
            let conns = group.conns.lock().unwrap_or_else(PoisonError::into_inner);
            let group_dirty = group.dirty.load(Ordering::Relaxed) != 0;
            for handle in conns.iter() {
                let dirty = handle.dirty.load(Ordering::Relaxed);
                let needed = match track {
                    TrackDirtyMode::Off => true,
                    TrackDirtyMode::Fast => group_dirty || dirty & DIRTY_WRITE != 0,
                    TrackDirtyMode::Conn => {
                        (group_dirty && dirty & DIRTY_READ != 0) || dirty & DIRTY_WRITE != 0
                    }
                };
                if needed {
                    handle.next.flush(flags)?;
                    handle.dirty.store(0, Ordering::Relaxed);
                }
            }
            group.dirty.store(0, Ordering::Relaxed);
            return Ok(());
        }

        // Not emulating: skip the flush when the image is clean.
        if track != TrackDirtyMode::Off && group.dirty.load(Ordering::Relaxed) == 0 {
            return Ok(());
        }
        self.state.next.flush(flags)?;
        match track {
            TrackDirtyMode::Conn => {
                if self.state.next.can_multi_conn()? {
                    let conns = group.conns.lock().unwrap_or_else(PoisonError::into_inner);
                    for handle in conns.iter() {
                        handle.dirty.store(0, Ordering::Relaxed);
                    }
                    group.dirty.store(0, Ordering::Relaxed);
                } else {
                    self.state.dirty.store(0, Ordering::Relaxed);
                }
            }
            TrackDirtyMode::Fast => group.dirty.store(0, Ordering::Relaxed),
            TrackDirtyMode::Off => {}
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use super::*;
    use crate::plugin::memory::MemoryPlugin;

    /// Memory plugin counting flushes, with no native multi-conn.
    #[derive(Debug)]
    struct FlushCounter {
        inner: MemoryPlugin,
        flushes: AtomicU64,
    }

    impl FlushCounter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryPlugin::new("sparse", 1 << 20).unwrap(),
                flushes: AtomicU64::new(0),
            })
        }
    }

    impl Backend for FlushCounter {
        fn name(&self) -> &'static str {
            "flush-counter"
        }

        fn get_size(&self) -> Result<u64> {
            self.inner.get_size()
        }

        fn can_write(&self) -> Result<bool> {
            Ok(true)
        }

        fn can_flush(&self) -> Result<bool> {
            Ok(true)
        }

        fn can_multi_conn(&self) -> Result<bool> {
            Ok(false)
        }

        fn pread(&self, buf: &mut [u8], offset: u64, flags: Flags) -> Result<()> {
            self.inner.pread(buf, offset, flags)
        }

        fn pwrite(&self, buf: &[u8], offset: u64, flags: Flags) -> Result<()> {
            self.inner.pwrite(buf, offset, flags)
        }

        fn flush(&self, _flags: Flags) -> Result<()> {
            self.flushes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[test]
    fn auto_resolves_to_emulate_and_advertises_multi_conn() {
        let plugin = FlushCounter::new();
        let coord = MultiConnCoordinator::new(MultiConnConfig::default());
        let conn = coord.open((Arc::clone(&plugin) as Arc<dyn Backend>), "");
        conn.prepare(false).unwrap();
        assert_eq!(conn.mode(), MultiConnMode::Emulate);
        assert!(conn.can_multi_conn().unwrap());
        conn.finalize().unwrap();
    }

    #[test]
    fn emulated_flush_covers_dirty_group_members() {
        let plugin = FlushCounter::new();
        let coord = MultiConnCoordinator::new(MultiConnConfig::default());
        let a = coord.open((Arc::clone(&plugin) as Arc<dyn Backend>), "");
        let b = coord.open((Arc::clone(&plugin) as Arc<dyn Backend>), "");
        a.prepare(false).unwrap();
        b.prepare(false).unwrap();

        // Both connections write; a flush on one flushes both.
        a.pwrite(&[1u8; 512], 0, Flags::NONE).unwrap();
        b.pwrite(&[2u8; 512], 4096, Flags::NONE).unwrap();
        a.flush(Flags::NONE).unwrap();
        assert_eq!(plugin.flushes.load(Ordering::Relaxed), 2);

        // Masks were cleared: a second flush does nothing.
        a.flush(Flags::NONE).unwrap();
        assert_eq!(plugin.flushes.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn clean_connections_are_skipped() {
        let plugin = FlushCounter::new();
        let coord = MultiConnCoordinator::new(MultiConnConfig::default());
        let a = coord.open((Arc::clone(&plugin) as Arc<dyn Backend>), "");
        let b = coord.open((Arc::clone(&plugin) as Arc<dyn Backend>), "");
        a.prepare(false).unwrap();
        b.prepare(false).unwrap();

        a.pwrite(&[1u8; 512], 0, Flags::NONE).unwrap();
        // b never wrote or read: only a's handle is flushed.
        a.flush(Flags::NONE).unwrap();
        assert_eq!(plugin.flushes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn export_name_grouping_separates_flushes() {
        let plugin = FlushCounter::new();
        let coord = MultiConnCoordinator::new(MultiConnConfig {
            by_export_name: true,
            ..MultiConnConfig::default()
        });
        let a = coord.open((Arc::clone(&plugin) as Arc<dyn Backend>), "one");
        let b = coord.open((Arc::clone(&plugin) as Arc<dyn Backend>), "two");
        a.prepare(false).unwrap();
        b.prepare(false).unwrap();

        b.pwrite(&[2u8; 512], 0, Flags::NONE).unwrap();
        // Flushing group "one" does not flush group "two"'s handle.
        a.flush(Flags::NONE).unwrap();
        assert_eq!(plugin.flushes.load(Ordering::Relaxed), 0);
        b.flush(Flags::NONE).unwrap();
        assert_eq!(plugin.flushes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn disable_mode_hides_multi_conn() {
        let plugin = FlushCounter::new();
        let coord = MultiConnCoordinator::new(MultiConnConfig {
            mode: MultiConnMode::Disable,
            ..MultiConnConfig::default()
        });
        let conn = coord.open((Arc::clone(&plugin) as Arc<dyn Backend>), "");
        conn.prepare(false).unwrap();
        assert!(!conn.can_multi_conn().unwrap());
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(MultiConnMode::from_str("emulate").unwrap(), MultiConnMode::Emulate);
        assert_eq!(MultiConnMode::from_str("unsafe").unwrap(), MultiConnMode::Unsafe);
        assert!(MultiConnMode::from_str("bogus").is_err());
        assert_eq!(TrackDirtyMode::from_str("conn").unwrap(), TrackDirtyMode::Conn);
        assert_eq!(TrackDirtyMode::from_str("connection").unwrap(), TrackDirtyMode::Conn);
        assert!(TrackDirtyMode::from_str("bogus").is_err());
    }
}
