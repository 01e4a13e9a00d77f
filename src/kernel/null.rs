use crate::error::Result;
use crate::file::{Device, RawMode};

// The bit bucket: reads hit end of file, writes vanish.
pub struct Null;

impl Device for Null {
    fn read(&self, _minor: u16, _mode: RawMode, _dst: &mut [u8]) -> Result<usize> {
        Ok(0)
    }
    fn write(&self, _minor: u16, _mode: RawMode, src: &[u8]) -> Result<usize> {
        Ok(src.len())
    }
    fn name(&self) -> &'static str {
        "null"
    }
}
