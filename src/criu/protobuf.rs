use std::io::Write;

use prost::Message;

use crate::criu::image::{read_full, Image};
use crate::error::{CrError, Result};

/// Appends one entry: native-endian u32 length followed by the message.
pub fn pb_write_one<M: Message>(img: &mut Image, obj: &M) -> Result<()> {
    let size = obj.encoded_len();

    let mut buf = Vec::with_capacity(4 + size);
    buf.extend_from_slice(&(size as u32).to_ne_bytes());
    obj.encode(&mut buf).map_err(|e| CrError::InvalidImage {
        reason: format!("Failed packing PB object: {}", e),
    })?;

    img.file_mut().write_all(&buf)?;
    Ok(())
}

/// Reads the next raw entry payload, `None` at a clean end of file.
pub fn read_raw_entry(img: &mut Image) -> Result<Option<Vec<u8>>> {
    let mut size_buf = [0u8; 4];
    let ret = read_full(img.file_mut(), &mut size_buf)?;

    if ret == 0 {
        return Ok(None);
    } else if ret < size_buf.len() {
        return Err(CrError::InvalidImage {
            reason: format!(
                "{}: read {} bytes while {} expected",
                img.path().display(),
                ret,
                size_buf.len()
            ),
        });
    }

    let size = u32::from_ne_bytes(size_buf) as usize;
    if size as u64 > img.raw_size()? {
        return Err(CrError::InvalidImage {
            reason: format!("{}: entry of {} bytes past end of image", img.path().display(), size),
        });
    }

    let mut buf = vec![0u8; size];

    let ret = read_full(img.file_mut(), &mut buf)?;
    if ret < size {
        return Err(CrError::InvalidImage {
            reason: format!(
                "{}: read {} bytes while {} expected",
                img.path().display(),
                ret,
                size
            ),
        });
    }

    Ok(Some(buf))
}

pub fn pb_read_one_eof<M: Message + Default>(img: &mut Image) -> Result<Option<M>> {
    match read_raw_entry(img)? {
        Some(buf) => Ok(Some(M::decode(&buf[..])?)),
        None => Ok(None),
    }
}

pub fn pb_read_one<M: Message + Default>(img: &mut Image) -> Result<M> {
    pb_read_one_eof(img)?.ok_or_else(|| CrError::InvalidImage {
        reason: format!("{}: unexpected EOF", img.path().display()),
    })
}

/// Reads every remaining entry of an image.
pub fn pb_read_all<M: Message + Default>(img: &mut Image) -> Result<Vec<M>> {
    let mut out = Vec::new();
    while let Some(m) = pb_read_one_eof(img)? {
        out.push(m);
    }
    Ok(out)
}
