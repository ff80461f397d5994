//! Channel declarations and their diagnostic metadata.

use core::fmt;
use core::ops::Deref;

use crate::NonVolatile;
use crate::engine::Writer;

use super::{Sink, Source, Stamped, sealed};

/// Capacity of a stored task or channel name, in bytes.
pub const NAME_CAP: usize = 32;

/// What a channel connects. Descriptive only; the runtime treats every kind
/// through the same field protocol.
#[derive(NonVolatile, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelKind {
    /// One producer task to one consumer task.
    #[default]
    Task,
    /// A task to its own future activations.
    SelfChannel,
    /// One producer task to several consumer tasks.
    Multicast,
    /// Caller to callee arguments.
    Call,
    /// Callee to caller results.
    Return,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelKind::Task => "task",
            ChannelKind::SelfChannel => "self",
            ChannelKind::Multicast => "multicast",
            ChannelKind::Call => "call",
            ChannelKind::Return => "return",
        };
        f.write_str(s)
    }
}

/// Fixed-capacity name stored inline in the image.
///
/// Longer names are truncated at a character boundary.
#[derive(NonVolatile, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Name {
    len: u8,
    bytes: [u8; NAME_CAP],
}

impl Name {
    /// Stores `name`, truncated to [`NAME_CAP`] bytes.
    #[must_use]
    pub fn new(name: &str) -> Self {
        let mut end = name.len().min(NAME_CAP);
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        let mut bytes = [0u8; NAME_CAP];
        bytes[..end].copy_from_slice(&name.as_bytes()[..end]);
        Self {
            len: end as u8,
            bytes,
        }
    }

    /// The stored name; `"?"` if the image holds bytes that are not UTF-8.
    #[must_use]
    pub fn as_str(&self) -> &str {
        let len = usize::from(self.len).min(NAME_CAP);
        core::str::from_utf8(&self.bytes[..len]).unwrap_or("?")
    }
}

impl Default for Name {
    fn default() -> Self {
        Self::new("")
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Diagnostic metadata stored next to every channel.
#[derive(NonVolatile, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ChanDiag {
    kind: ChannelKind,
    source: Name,
    dest: Name,
}

impl ChanDiag {
    /// Channel kind tag.
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Producer name.
    pub fn source(&self) -> &Name {
        &self.source
    }

    /// Consumer name; `mc:<name>` for multicast channels.
    pub fn dest(&self) -> &Name {
        &self.dest
    }
}

impl fmt::Display for ChanDiag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} ({})", self.source, self.dest, self.kind)
    }
}

/// A declared channel: diagnostic metadata plus the application's field
/// struct `D`.
///
/// Dereferences to `D`, so fields are reached as `channel.field_name`.
#[derive(NonVolatile)]
#[repr(C)]
pub struct Channel<D> {
    diag: ChanDiag,
    data: D,
}

impl<D> Channel<D> {
    fn with(kind: ChannelKind, source: &str, dest: &str, data: D) -> Self {
        Self {
            diag: ChanDiag {
                kind,
                source: Name::new(source),
                dest: Name::new(dest),
            },
            data,
        }
    }

    /// Point-to-point channel from `source` to `dest`.
    pub fn task(source: &str, dest: &str, data: D) -> Self {
        Self::with(ChannelKind::Task, source, dest, data)
    }

    /// Self channel of `task`.
    pub fn self_channel(task: &str, data: D) -> Self {
        Self::with(ChannelKind::SelfChannel, task, task, data)
    }

    /// Multicast channel `name` fed by `source`.
    pub fn multicast(name: &str, source: &str, data: D) -> Self {
        Self::with(ChannelKind::Multicast, source, &format!("mc:{name}"), data)
    }

    /// Argument channel from `caller` to `callee`.
    pub fn call(caller: &str, callee: &str, data: D) -> Self {
        Self::with(ChannelKind::Call, caller, callee, data)
    }

    /// Result channel from `callee` back to `caller`.
    pub fn ret(callee: &str, caller: &str, data: D) -> Self {
        Self::with(ChannelKind::Return, callee, caller, data)
    }

    /// Diagnostic metadata.
    pub fn diag(&self) -> &ChanDiag {
        &self.diag
    }

    /// A field of this channel tagged with the channel's metadata, so reads
    /// and writes through it are traced with source and destination names.
    pub fn at<'a, F>(&'a self, pick: impl FnOnce(&'a D) -> &'a F) -> Endpoint<'a, F> {
        Endpoint {
            diag: &self.diag,
            field: pick(&self.data),
        }
    }
}

impl<D> Deref for Channel<D> {
    type Target = D;
    fn deref(&self) -> &D {
        &self.data
    }
}

impl<D: fmt::Debug> fmt::Debug for Channel<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("diag", &self.diag)
            .field("data", &self.data)
            .finish()
    }
}

/// A channel field paired with its channel's metadata.
pub struct Endpoint<'a, F> {
    diag: &'a ChanDiag,
    field: &'a F,
}

impl<F> sealed::Sealed for Endpoint<'_, F> {}

impl<T: Copy, F: Source<T>> Source<T> for Endpoint<'_, F> {
    fn current(&self) -> Stamped<T> {
        self.field.current()
    }

    fn diag(&self) -> Option<&ChanDiag> {
        Some(self.diag)
    }
}

impl<T: Copy, F: Sink<T>> Sink<T> for Endpoint<'_, F> {
    fn put(&self, value: T, w: &Writer<'_>) {
        self.field.put(value, w);
    }

    fn diag(&self) -> Option<&ChanDiag> {
        Some(self.diag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Field;

    #[derive(NonVolatile, Default, Debug)]
    #[repr(C)]
    struct Reading {
        value: Field<u16>,
    }

    #[test]
    fn test_name_roundtrip() {
        assert_eq!(Name::new("task_a").as_str(), "task_a");
        assert_eq!(Name::default().as_str(), "");
    }

    #[test]
    fn test_name_truncates_on_char_boundary() {
        let long = "é".repeat(NAME_CAP);
        let name = Name::new(&long);
        assert!(name.as_str().len() <= NAME_CAP);
        assert!(name.as_str().chars().all(|c| c == 'é'));
        assert_eq!(name.as_str().len() % 2, 0);
    }

    #[test]
    fn test_channel_kinds() {
        let t = Channel::task("a", "b", Reading::default());
        assert_eq!(t.diag().kind(), ChannelKind::Task);
        assert_eq!(t.diag().to_string(), "a -> b (task)");

        let s = Channel::self_channel("a", Reading::default());
        assert_eq!(s.diag().kind(), ChannelKind::SelfChannel);
        assert_eq!(s.diag().source(), s.diag().dest());

        let m = Channel::multicast("temps", "sense", Reading::default());
        assert_eq!(m.diag().dest().as_str(), "mc:temps");

        let c = Channel::call("main", "filter", Reading::default());
        let r = Channel::ret("filter", "main", Reading::default());
        assert_eq!(c.diag().kind(), ChannelKind::Call);
        assert_eq!(r.diag().kind(), ChannelKind::Return);
        assert_eq!(r.diag().dest().as_str(), "main");
    }

    #[test]
    fn test_endpoint_carries_diag() {
        let ch = Channel::task("a", "b", Reading::default());
        let ep = ch.at(|d| &d.value);
        let diag = Source::<u16>::diag(&ep).map(|d| d.source().as_str());
        assert_eq!(diag, Some("a"));
        assert!(Source::<u16>::current(&ep).time.is_zero());
    }
}
