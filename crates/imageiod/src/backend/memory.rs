//! Memory backend, for tests and demos.

use std::sync::Mutex;

use async_trait::async_trait;

use imageio_proto::{Error, Extent, ImageResult};

use crate::backend::{Backend, BackendOptions};

pub struct MemBackend {
    data: Mutex<Vec<u8>>,
    writable: bool,
}

impl std::fmt::Debug for MemBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBackend").finish()
    }
}

impl MemBackend {
    pub fn new(size: usize, writable: bool) -> MemBackend {
        MemBackend {
            data: Mutex::new(vec![0u8; size]),
            writable,
        }
    }

    pub fn with_data(data: Vec<u8>, opts: &BackendOptions) -> MemBackend {
        MemBackend {
            data: Mutex::new(data),
            writable: opts.writable,
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    fn check(&self, offset: u64, length: u64) -> ImageResult<()> {
        let size = self.data.lock().unwrap().len() as u64;
        if offset.checked_add(length).map_or(true, |end| end > size) {
            return Err(Error::RangeNotSatisfiable { size });
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MemBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn size(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }

    fn block_size(&self) -> usize {
        1
    }

    fn max_readers(&self) -> u32 {
        1
    }

    fn max_writers(&self) -> u32 {
        1
    }

    async fn read_at(&self, buf: &mut [u8], offset: u64) -> ImageResult<()> {
        self.check(offset, buf.len() as u64)?;
        let data = self.data.lock().unwrap();
        let start = offset as usize;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    async fn write_at(&self, buf: &[u8], offset: u64, _flush: bool) -> ImageResult<()> {
        if !self.writable {
            return Err(Error::NotSupported("backend is read only".into()));
        }
        self.check(offset, buf.len() as u64)?;
        let mut data = self.data.lock().unwrap();
        let start = offset as usize;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    async fn zero(
        &self,
        offset: u64,
        length: u64,
        _flush: bool,
        _punch_hole: bool,
    ) -> ImageResult<()> {
        if !self.writable {
            return Err(Error::NotSupported("backend is read only".into()));
        }
        self.check(offset, length)?;
        let mut data = self.data.lock().unwrap();
        let start = offset as usize;
        data[start..start + length as usize].fill(0);
        Ok(())
    }

    async fn flush(&self) -> ImageResult<()> {
        Ok(())
    }

    async fn extents_zero(&self) -> ImageResult<Vec<Extent>> {
        Ok(vec![Extent::new(0, self.size(), false, false)])
    }

    async fn close(&self) -> ImageResult<()> {
        Ok(())
    }
}
