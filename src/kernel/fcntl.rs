use crate::error::{Error::*, Result};

pub mod omode {
    pub const RDONLY: u16 = 0;
    pub const WRONLY: u16 = 1;
    pub const RDWR: u16 = 2;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OMode {
    read: bool,
    write: bool,
}

impl OMode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&mut self, read: bool) -> &mut Self {
        self.read = read;
        self
    }
    pub fn write(&mut self, write: bool) -> &mut Self {
        self.write = write;
        self
    }

    pub fn from_bits(bits: u16) -> Result<Self> {
        if bits > omode::RDWR {
            return Err(InvalidArgument);
        }
        let mut mode = Self::new();
        mode.read(bits != omode::WRONLY).write(bits != omode::RDONLY);
        Ok(mode)
    }

    // The value kept in an open file table entry.
    pub fn bits(&self) -> u8 {
        match (self.read, self.write) {
            (true, true) => omode::RDWR as u8,
            (false, true) => omode::WRONLY as u8,
            _ => omode::RDONLY as u8,
        }
    }

    pub fn is_read(&self) -> bool {
        self.read
    }

    pub fn is_write(&self) -> bool {
        self.write
    }
}

// lseek() origins. The last three count in blocks.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    Set = 0,
    Cur = 1,
    End = 2,
    SetBlk = 3,
    CurBlk = 4,
    EndBlk = 5,
}

impl Whence {
    pub fn from_u16(v: u16) -> Result<Self> {
        Ok(match v {
            0 => Self::Set,
            1 => Self::Cur,
            2 => Self::End,
            3 => Self::SetBlk,
            4 => Self::CurBlk,
            5 => Self::EndBlk,
            _ => return Err(InvalidArgument),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_flags() {
        let m = OMode::from_bits(omode::WRONLY).unwrap();
        assert!(!m.is_read() && m.is_write());
        assert_eq!(OMode::from_bits(omode::RDWR).unwrap().bits(), 2);
        assert_eq!(OMode::from_bits(3), Err(InvalidArgument));
        assert_eq!(Whence::from_u16(6), Err(InvalidArgument));
    }
}
