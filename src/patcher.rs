//! Output stream patching.
//!
//! After the PE bytes have been assembled into one in-memory blob, the
//! patcher streams them to the caller's output, substituting the rewritten
//! COR header and the final value at every relocation site. Sites must be
//! visited in ascending file order; the image before the current cursor has
//! already been written and cannot be revisited.

use anyhow::{ensure, Context, Result};
use std::io::Write;

use crate::cor::{CorHeader, COR_HEADER_SIZE};
use crate::reloc::RelocType;

pub struct ImagePatcher<'a, W: Write> {
    image: &'a [u8],
    cursor: usize,
    output: W,
    image_base: u64,
}

impl<'a, W: Write> ImagePatcher<'a, W> {
    pub fn new(image: &'a [u8], image_base: u64, output: W) -> Self {
        Self {
            image,
            cursor: 0,
            output,
            image_base,
        }
    }

    /// Copies unprocessed input up to `file_pos`.
    fn copy_to(&mut self, file_pos: usize) -> Result<()> {
        ensure!(
            file_pos >= self.cursor,
            "patch site at {:#x} precedes the output cursor {:#x}",
            file_pos,
            self.cursor
        );
        ensure!(
            file_pos <= self.image.len(),
            "patch site at {:#x} lies outside the assembled image",
            file_pos
        );
        self.output
            .write_all(&self.image[self.cursor..file_pos])
            .context("writing output image")?;
        self.cursor = file_pos;
        Ok(())
    }

    /// Emits the rewritten COR header over the placeholder at `file_pos`.
    pub fn write_cor_header(&mut self, header: &CorHeader, file_pos: usize) -> Result<()> {
        self.copy_to(file_pos)?;
        ensure!(
            self.cursor + COR_HEADER_SIZE <= self.image.len(),
            "COR header at {:#x} lies outside the assembled image",
            file_pos
        );
        self.output
            .write_all(&header.serialize())
            .context("writing COR header")?;
        self.cursor += COR_HEADER_SIZE;
        Ok(())
    }

    /// Applies one relocation at `file_pos` and writes the patched site.
    pub fn patch(
        &mut self,
        kind: RelocType,
        site_rva: u32,
        target_rva: u32,
        file_pos: usize,
    ) -> Result<()> {
        let len = kind.site_len();
        if len == 0 {
            return Ok(());
        }
        self.copy_to(file_pos)?;
        ensure!(
            self.cursor + len <= self.image.len(),
            "relocation site at {:#x} lies outside the assembled image",
            file_pos
        );
        let mut site = [0u8; 8];
        let site = &mut site[..len];
        site.copy_from_slice(&self.image[self.cursor..self.cursor + len]);
        kind.apply(site_rva, target_rva, self.image_base, site)?;
        self.output.write_all(site).context("writing patched site")?;
        self.cursor += len;
        Ok(())
    }

    /// Copies the remainder of the image and flushes the output.
    pub fn finish(mut self) -> Result<()> {
        let len = self.image.len();
        self.copy_to(len)?;
        self.output.flush().context("flushing output image")?;
        Ok(())
    }
}
