// SPDX-FileCopyrightText: Copyright © 2025 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Physical volume I/O pool
//!
//! The readers backing a volume group's physical volumes, addressed by
//! physical volume index. The pool is shared between a volume and its
//! unlocked logical volumes, which serialize their seek+read pairs on it.

use std::io::{Read, Seek, SeekFrom};

use crate::Error;

/// Indexed set of reader handles for the volume group's physical volumes
#[derive(Debug, Default)]
pub struct IoPool<R> {
    handles: Vec<Option<R>>,
}

impl<R: Read + Seek> IoPool<R> {
    pub fn new() -> Self {
        Self { handles: Vec::new() }
    }

    /// Installs `handle` as physical volume `index`, growing the pool.
    pub fn set_handle(&mut self, index: usize, handle: R) {
        if index >= self.handles.len() {
            self.handles.resize_with(index + 1, || None);
        }
        self.handles[index] = Some(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub(crate) fn handle_mut(&mut self, index: usize) -> Result<&mut R, Error> {
        self.handles
            .get_mut(index)
            .and_then(|handle| handle.as_mut())
            .ok_or(Error::ValueMissing("physical volume handle"))
    }

    /// Positioned read on physical volume `index`.
    pub(crate) fn read_exact_at(
        &mut self,
        index: usize,
        offset: u64,
        buffer: &mut [u8],
    ) -> Result<(), Error> {
        let handle = self.handle_mut(index)?;
        handle.seek(SeekFrom::Start(offset))?;
        handle.read_exact(buffer)?;
        Ok(())
    }
}
