use core::fmt;

pub type Result<T> = core::result::Result<T, Error>;

// Error numbers as seen by user programs in u_error.
#[repr(i16)]
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Error {
    Uncategorized,
    NotPermitted = 1,
    NotFound = 2,
    NoSuchProcess = 3,
    Interrupted = 4,
    Io = 5,
    NoSuchNode = 6,
    ArgumentListTooLong = 7,
    ExecFileFormatError = 8,
    BadFileDescriptor = 9,
    NoChildProcesses = 10,
    WouldBlock = 11,
    OutOfMemory = 12,
    PermissionDenied = 13,
    BadAddress = 14,
    NotBlockDevice = 15,
    ResourceBusy = 16,
    AlreadyExists = 17,
    CrossesDevices = 18,
    NoSuchDevice = 19,
    NotADirectory = 20,
    IsADirectory = 21,
    InvalidArgument = 22,
    FileTableOverflow = 23,
    TooManyOpenFiles = 24,
    NotATty = 25,
    TextFileBusy = 26,
    FileTooLarge = 27,
    StorageFull = 28,
    IllegalSeek = 29,
    ReadOnlyFs = 30,
    TooManyLinks = 31,
    BrokenPipe = 32,
    NameTooLong = 63,
}

impl Error {
    pub fn as_str(&self) -> &'static str {
        use Error::*;
        match *self {
            NotPermitted => "operation not permitted",
            NotFound => "entry not found",
            NoSuchProcess => "no such process",
            Interrupted => "operation interrupted",
            Io => "i/o error",
            NoSuchNode => "no such device or address",
            ArgumentListTooLong => "argument list too long",
            ExecFileFormatError => "executable file format error",
            BadFileDescriptor => "bad file descriptor",
            NoChildProcesses => "no child processes",
            WouldBlock => "resource temporarily unavailable",
            OutOfMemory => "out of memory",
            PermissionDenied => "permission denied",
            BadAddress => "bad address",
            NotBlockDevice => "block device required",
            ResourceBusy => "resource busy",
            AlreadyExists => "entity already exists",
            CrossesDevices => "cross-device link",
            NoSuchDevice => "no such device",
            NotADirectory => "not a directory",
            IsADirectory => "is a directory",
            InvalidArgument => "invalid argument",
            FileTableOverflow => "file table overflow",
            TooManyOpenFiles => "too many open files",
            NotATty => "not a typewriter",
            TextFileBusy => "text file busy",
            FileTooLarge => "file too large",
            StorageFull => "no space left on device",
            IllegalSeek => "illegal seek",
            ReadOnlyFs => "read-only file system",
            TooManyLinks => "too many links",
            BrokenPipe => "broken pipe",
            NameTooLong => "file name too long",
            Uncategorized => "uncategorized error",
        }
    }

    pub fn errno(&self) -> i16 {
        match *self {
            Error::Uncategorized => -1,
            e => e as i16,
        }
    }

    pub fn from_errno(code: i16) -> Self {
        use Error::*;
        match code {
            1 => NotPermitted,
            2 => NotFound,
            3 => NoSuchProcess,
            4 => Interrupted,
            5 => Io,
            6 => NoSuchNode,
            7 => ArgumentListTooLong,
            8 => ExecFileFormatError,
            9 => BadFileDescriptor,
            10 => NoChildProcesses,
            11 => WouldBlock,
            12 => OutOfMemory,
            13 => PermissionDenied,
            14 => BadAddress,
            15 => NotBlockDevice,
            16 => ResourceBusy,
            17 => AlreadyExists,
            18 => CrossesDevices,
            19 => NoSuchDevice,
            20 => NotADirectory,
            21 => IsADirectory,
            22 => InvalidArgument,
            23 => FileTableOverflow,
            24 => TooManyOpenFiles,
            25 => NotATty,
            26 => TextFileBusy,
            27 => FileTooLarge,
            28 => StorageFull,
            29 => IllegalSeek,
            30 => ReadOnlyFs,
            31 => TooManyLinks,
            32 => BrokenPipe,
            63 => NameTooLong,
            _ => Uncategorized,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn errno_round_trips() {
        for code in (1..=32).chain([63]) {
            assert_eq!(Error::from_errno(code).errno(), code);
        }
        assert_eq!(Error::from_errno(40), Error::Uncategorized);
        assert_eq!(Error::BrokenPipe.to_string(), "broken pipe");
    }
}
