//! `wasi:filesystem`: descriptors and preopened directories.

use super::clocks::Datetime;
use super::io::{ERROR, OUTPUT_STREAM};
use crate::func::{ComponentValue, Operation, take_flags, typecheck_flags};
use crate::resources::ResourceKind;
use crate::types::Type;
use crate::values::Val;
use anyhow::{Result, bail};
use std::sync::LazyLock;

pub const TYPES_INTERFACE: &str = "wasi:filesystem/types@0.2.2";
pub const PREOPENS_INTERFACE: &str = "wasi:filesystem/preopens@0.2.2";

pub const DESCRIPTOR: ResourceKind = ResourceKind::new(6);

bitflags::bitflags! {
    /// Access and synchronization flags of an open descriptor.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
    pub struct DescriptorFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const FILE_INTEGRITY_SYNC = 1 << 2;
        const DATA_INTEGRITY_SYNC = 1 << 3;
        const REQUESTED_WRITE_SYNC = 1 << 4;
        const MUTATE_DIRECTORY = 1 << 5;
    }
}

impl DescriptorFlags {
    /// Flag names; bit `i` is named `NAMES[i]`.
    pub const NAMES: &'static [&'static str] = &[
        "read",
        "write",
        "file-integrity-sync",
        "data-integrity-sync",
        "requested-write-sync",
        "mutate-directory",
    ];

    /// The `descriptor-flags` type.
    pub fn ty() -> Type {
        static TY: LazyLock<Type> =
            LazyLock::new(|| Type::flags(DescriptorFlags::NAMES.iter().copied()));
        TY.clone()
    }
}

impl ComponentValue for DescriptorFlags {
    fn typecheck(ty: &Type) -> Result<()> {
        typecheck_flags(ty, DescriptorFlags::NAMES)
    }

    fn into_val(self) -> Val {
        let names = DescriptorFlags::NAMES
            .iter()
            .enumerate()
            .filter(|(i, _)| self.bits() & (1 << i) != 0)
            .map(|(_, name)| name.to_string());
        Val::Flags(names.collect())
    }

    fn from_val(val: Val) -> Result<DescriptorFlags> {
        let mut flags = DescriptorFlags::empty();
        for name in take_flags(val)? {
            let Some(i) = DescriptorFlags::NAMES.iter().position(|n| *n == name) else {
                bail!("unknown flag `{name}` of descriptor-flags");
            };
            flags |= DescriptorFlags::from_bits_retain(1 << i);
        }
        Ok(flags)
    }
}

wit_enum! {
    /// The type of a filesystem object.
    pub enum DescriptorType = "descriptor-type" {
        Unknown = "unknown",
        BlockDevice = "block-device",
        CharacterDevice = "character-device",
        Directory = "directory",
        Fifo = "fifo",
        SymbolicLink = "symbolic-link",
        RegularFile = "regular-file",
        Socket = "socket",
    }
}

wit_enum! {
    /// Error codes of filesystem operations, mostly mirroring POSIX `errno`.
    pub enum ErrorCode = "error-code" {
        Access = "access",
        WouldBlock = "would-block",
        Already = "already",
        BadDescriptor = "bad-descriptor",
        Busy = "busy",
        Deadlock = "deadlock",
        Quota = "quota",
        Exist = "exist",
        FileTooLarge = "file-too-large",
        IllegalByteSequence = "illegal-byte-sequence",
        InProgress = "in-progress",
        Interrupted = "interrupted",
        Invalid = "invalid",
        Io = "io",
        IsDirectory = "is-directory",
        Loop = "loop",
        TooManyLinks = "too-many-links",
        MessageSize = "message-size",
        NameTooLong = "name-too-long",
        NoDevice = "no-device",
        NoEntry = "no-entry",
        NoLock = "no-lock",
        InsufficientMemory = "insufficient-memory",
        InsufficientSpace = "insufficient-space",
        NotDirectory = "not-directory",
        NotEmpty = "not-empty",
        NotRecoverable = "not-recoverable",
        Unsupported = "unsupported",
        NoTty = "no-tty",
        NoSuchDevice = "no-such-device",
        Overflow = "overflow",
        NotPermitted = "not-permitted",
        Pipe = "pipe",
        ReadOnly = "read-only",
        InvalidSeek = "invalid-seek",
        TextFileBusy = "text-file-busy",
        CrossDevice = "cross-device",
    }
}

impl std::error::Error for ErrorCode {}

impl From<std::io::ErrorKind> for ErrorCode {
    fn from(kind: std::io::ErrorKind) -> ErrorCode {
        use std::io::ErrorKind;
        match kind {
            ErrorKind::NotFound => ErrorCode::NoEntry,
            ErrorKind::PermissionDenied => ErrorCode::NotPermitted,
            ErrorKind::AlreadyExists => ErrorCode::Exist,
            ErrorKind::WouldBlock => ErrorCode::WouldBlock,
            ErrorKind::InvalidInput => ErrorCode::Invalid,
            ErrorKind::Interrupted => ErrorCode::Interrupted,
            ErrorKind::Unsupported => ErrorCode::Unsupported,
            ErrorKind::OutOfMemory => ErrorCode::InsufficientMemory,
            ErrorKind::BrokenPipe => ErrorCode::Pipe,
            ErrorKind::NotADirectory => ErrorCode::NotDirectory,
            ErrorKind::IsADirectory => ErrorCode::IsDirectory,
            ErrorKind::DirectoryNotEmpty => ErrorCode::NotEmpty,
            ErrorKind::ReadOnlyFilesystem => ErrorCode::ReadOnly,
            ErrorKind::StorageFull => ErrorCode::InsufficientSpace,
            ErrorKind::FileTooLarge => ErrorCode::FileTooLarge,
            ErrorKind::ResourceBusy => ErrorCode::Busy,
            ErrorKind::Deadlock => ErrorCode::Deadlock,
            ErrorKind::CrossesDevices => ErrorCode::CrossDevice,
            ErrorKind::TooManyLinks => ErrorCode::TooManyLinks,
            ErrorKind::InvalidFilename => ErrorCode::NameTooLong,
            ErrorKind::NotSeekable => ErrorCode::InvalidSeek,
            ErrorKind::ExecutableFileBusy => ErrorCode::TextFileBusy,
            _ => ErrorCode::Io,
        }
    }
}

/// Metadata of a filesystem object.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DescriptorStat {
    pub type_: DescriptorType,
    pub link_count: u64,
    pub size: u64,
    pub data_access_timestamp: Option<Datetime>,
    pub data_modification_timestamp: Option<Datetime>,
    pub status_change_timestamp: Option<Datetime>,
}

wit_record!(DescriptorStat {
    type_: DescriptorType = "type",
    link_count: u64 = "link-count",
    size: u64 = "size",
    data_access_timestamp: Option<Datetime> = "data-access-timestamp",
    data_modification_timestamp: Option<Datetime> = "data-modification-timestamp",
    status_change_timestamp: Option<Datetime> = "status-change-timestamp",
});

impl DescriptorStat {
    /// The `descriptor-stat` record.
    pub fn ty() -> Type {
        static TY: LazyLock<Type> = LazyLock::new(|| {
            let timestamp = || Type::option(Datetime::ty());
            Type::record([
                ("type", DescriptorType::ty()),
                ("link-count", Type::U64),
                ("size", Type::U64),
                ("data-access-timestamp", timestamp()),
                ("data-modification-timestamp", timestamp()),
                ("status-change-timestamp", timestamp()),
            ])
        });
        TY.clone()
    }
}

fn fs_result(ok: Type) -> Option<Type> {
    Some(Type::result(Some(ok), Some(ErrorCode::ty())))
}

/// Operations of `wasi:filesystem/types` and `wasi:filesystem/preopens`.
pub fn operations() -> Vec<Operation> {
    let this = || Type::borrow(DESCRIPTOR);
    vec![
        Operation::new(
            TYPES_INTERFACE,
            "[method]descriptor.write-via-stream",
            [this(), Type::U64],
            fs_result(Type::own(OUTPUT_STREAM)),
        ),
        Operation::new(
            TYPES_INTERFACE,
            "[method]descriptor.append-via-stream",
            [this()],
            fs_result(Type::own(OUTPUT_STREAM)),
        ),
        Operation::new(
            TYPES_INTERFACE,
            "[method]descriptor.get-flags",
            [this()],
            fs_result(DescriptorFlags::ty()),
        ),
        Operation::new(
            TYPES_INTERFACE,
            "[method]descriptor.get-type",
            [this()],
            fs_result(DescriptorType::ty()),
        ),
        Operation::new(
            TYPES_INTERFACE,
            "[method]descriptor.stat",
            [this()],
            fs_result(DescriptorStat::ty()),
        ),
        Operation::new(
            TYPES_INTERFACE,
            "filesystem-error-code",
            [Type::borrow(ERROR)],
            Some(Type::option(ErrorCode::ty())),
        ),
        Operation::new(
            PREOPENS_INTERFACE,
            "get-directories",
            [],
            Some(Type::list(Type::tuple([
                Type::own(DESCRIPTOR),
                Type::String,
            ]))),
        ),
    ]
}
