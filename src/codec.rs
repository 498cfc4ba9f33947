use std::cell::RefCell;

use zstd::zstd_safe::{self, CCtx, CDict, DCtx, DDict};

use crate::error::{Error, Result};

// One compression and one decompression context per worker thread,
// created on first use and reused for every request on that thread.
thread_local! {
    static CCTX: RefCell<CCtx<'static>> = RefCell::new(CCtx::create());
    static DCTX: RefCell<DCtx<'static>> = RefCell::new(DCtx::create());
}

/// Compiled dictionary handles, shared read-only across threads and
/// routing-table generations via the dictionary pool.
pub struct CompiledDict {
    cdict: CDict<'static>,
    ddict: DDict<'static>,
    len: usize,
}

impl CompiledDict {
    /// Compile compressor- and decompressor-side handles from raw
    /// dictionary bytes.
    pub fn compile(bytes: &[u8], level: i32) -> Self {
        Self {
            cdict: CDict::create(bytes, level),
            ddict: DDict::create(bytes),
            len: bytes.len(),
        }
    }

    /// Size of the raw dictionary this was compiled from.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for CompiledDict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledDict").field("len", &self.len).finish()
    }
}

/// Worst-case compressed size for a source of `len` bytes.
pub fn compress_bound(len: usize) -> usize {
    zstd_safe::compress_bound(len)
}

/// Compress `src` into `dst` using the thread-local context, with the
/// given dictionary or dict-less at `level`. `dst` is cleared and grown
/// to the compress bound; on success it holds exactly the frame.
/// Returns the compressed length.
pub fn compress_into(
    dst: &mut Vec<u8>,
    src: &[u8],
    dict: Option<&CompiledDict>,
    level: i32,
) -> Result<usize> {
    dst.clear();
    dst.reserve(compress_bound(src.len()));
    CCTX.with(|cctx| {
        let mut cctx = cctx.borrow_mut();
        let written = match dict {
            Some(d) => cctx.compress_using_cdict(dst, src, &d.cdict),
            None => cctx.compress(dst, src, level),
        }
        .map_err(|code| Error::Codec(zstd_safe::get_error_name(code).to_string()))?;
        Ok(written)
    })
}

/// Decompress a whole frame using the thread-local context. `capacity`
/// must be at least the original size (callers derive it from the frame
/// header). Returns the output buffer, ownership transferred.
pub fn decompress(src: &[u8], dict: Option<&CompiledDict>, capacity: usize) -> Result<Vec<u8>> {
    let mut dst = Vec::with_capacity(capacity);
    DCTX.with(|dctx| {
        let mut dctx = dctx.borrow_mut();
        match dict {
            Some(d) => dctx.decompress_using_ddict(&mut dst, src, &d.ddict),
            None => dctx.decompress(&mut dst, src),
        }
        .map_err(|code| Error::Codec(zstd_safe::get_error_name(code).to_string()))
    })?;
    Ok(dst)
}

/// Original size recorded in a frame header. `Ok(None)` means the frame
/// does not carry a content size; `Err` means the header is corrupt.
pub fn frame_content_size(src: &[u8]) -> Result<Option<u64>> {
    zstd_safe::get_frame_content_size(src)
        .map_err(|_| Error::InvalidData("corrupt frame header".into()))
}

/// Train a dictionary from flattened samples. `sizes[i]` is the length
/// of the i-th sample inside `flat`; `max_size` caps the output.
pub fn train_from_continuous(flat: &[u8], sizes: &[usize], max_size: usize) -> Result<Vec<u8>> {
    zstd::dict::from_continuous(flat, sizes, max_size)
        .map_err(|e| Error::Codec(e.to_string()))
}
