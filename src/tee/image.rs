//! Enclave image metadata
//!
//! Signed images are ELF64 files carrying their build-time measurement in a
//! `.note.penglaimeta` section whose single note is named `penglai_metadata`.
//! The note descriptor starts with the 32-byte measurement.

use super::crypto::{Hash, HASH_SIZE};
use super::enclave::TeeError;
use std::path::{Path, PathBuf};

pub const META_SECTION: &str = ".note.penglaimeta";
pub const META_NOTE_NAME: &str = "penglai_metadata";
pub const IMAGE_SUFFIX: &str = ".signed.so";

const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const ELF_HEADER_SIZE: usize = 64;
const SECTION_HEADER_SIZE: usize = 64;
const NOTE_HEADER_SIZE: usize = 12;
const SHT_NOTE: u32 = 7;
const SHT_STRTAB: u32 = 3;

/// Path of the signed image for an enclave name
///
/// Anything that already looks like a path is returned unchanged.
pub fn image_path(dir: &Path, name: &str) -> PathBuf {
    if name.ends_with(".so") || name.contains('/') {
        PathBuf::from(name)
    } else {
        dir.join(format!("{}{}", name, IMAGE_SUFFIX))
    }
}

fn bad(msg: impl Into<String>) -> TeeError {
    TeeError::ImageError(msg.into())
}

fn slice(data: &[u8], offset: u64, len: u64) -> Result<&[u8], TeeError> {
    let start = usize::try_from(offset).map_err(|_| bad("offset out of range"))?;
    let len = usize::try_from(len).map_err(|_| bad("length out of range"))?;
    let end = start.checked_add(len).ok_or_else(|| bad("length overflow"))?;
    data.get(start..end)
        .ok_or_else(|| bad(format!("read of {} bytes at {} past end of image", len, start)))
}

fn u16_at(data: &[u8], offset: u64) -> Result<u16, TeeError> {
    let mut b = [0u8; 2];
    b.copy_from_slice(slice(data, offset, 2)?);
    Ok(u16::from_le_bytes(b))
}

fn u32_at(data: &[u8], offset: u64) -> Result<u32, TeeError> {
    let mut b = [0u8; 4];
    b.copy_from_slice(slice(data, offset, 4)?);
    Ok(u32::from_le_bytes(b))
}

fn u64_at(data: &[u8], offset: u64) -> Result<u64, TeeError> {
    let mut b = [0u8; 8];
    b.copy_from_slice(slice(data, offset, 8)?);
    Ok(u64::from_le_bytes(b))
}

fn cstr_at(data: &[u8], offset: u64) -> Result<&[u8], TeeError> {
    let start = usize::try_from(offset).map_err(|_| bad("offset out of range"))?;
    let tail = data.get(start..).ok_or_else(|| bad("string past end of image"))?;
    let len = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| bad("unterminated section name"))?;
    Ok(&tail[..len])
}

fn round_to(value: u64, align: u64) -> Option<u64> {
    if align <= 1 {
        Some(value)
    } else {
        value.div_ceil(align).checked_mul(align)
    }
}

/// `base + offset`, rejecting offsets that wrap
fn add(base: u64, offset: u64) -> Result<u64, TeeError> {
    base.checked_add(offset).ok_or_else(|| bad("offset out of range"))
}

/// Locate the measurement note; returns `(offset, size)` of its descriptor
pub fn meta_property(data: &[u8]) -> Result<(u64, u64), TeeError> {
    if data.len() < ELF_HEADER_SIZE || &data[..4] != ELF_MAGIC {
        return Err(bad("not an ELF image"));
    }
    if data[4] != 2 {
        return Err(bad("not an ELF64 image"));
    }

    let shoff = u64_at(data, 0x28)?;
    let shentsize = u64::from(u16_at(data, 0x3A)?);
    let shnum = u64::from(u16_at(data, 0x3C)?);
    let shstrndx = u64::from(u16_at(data, 0x3E)?);
    let header = |index: u64| {
        index
            .checked_mul(shentsize)
            .and_then(|rel| shoff.checked_add(rel))
            .ok_or_else(|| bad("offset out of range"))
    };

    let strtab = u64_at(data, add(header(shstrndx)?, 24)?)?;

    let mut section = None;
    for index in 0..shnum {
        let sh = header(index)?;
        let named = u32_at(data, sh)
            .and_then(|name| add(strtab, u64::from(name)))
            .and_then(|at| cstr_at(data, at))
            .map(|name| name == META_SECTION.as_bytes())
            .unwrap_or(false);
        if named {
            section = Some(sh);
            break;
        }
    }
    let section = section.ok_or_else(|| bad(format!("image has no '{}' section", META_SECTION)))?;

    let sh_offset = u64_at(data, add(section, 24)?)?;
    let sh_size = u64_at(data, add(section, 32)?)?;
    let sh_addralign = u64_at(data, add(section, 48)?)?;

    let namesz = u64::from(u32_at(data, sh_offset)?);
    let descsz = u64::from(u32_at(data, add(sh_offset, 4)?)?);
    let note_size = NOTE_HEADER_SIZE as u64 + namesz + descsz;
    if round_to(note_size, sh_addralign) != Some(sh_size) {
        return Err(bad(format!("'{}' section size is not correct", META_SECTION)));
    }

    let expected = META_NOTE_NAME.len() as u64 + 1;
    let name_at = add(sh_offset, NOTE_HEADER_SIZE as u64)?;
    let name = slice(data, name_at, namesz)?;
    if namesz != expected
        || &name[..META_NOTE_NAME.len()] != META_NOTE_NAME.as_bytes()
        || name[META_NOTE_NAME.len()] != 0
    {
        return Err(bad(format!("note must be named \"{}\"", META_NOTE_NAME)));
    }

    Ok((add(name_at, namesz)?, descsz))
}

/// Build-time measurement recorded in an image
pub fn measurement_of(data: &[u8]) -> Result<Hash, TeeError> {
    let (offset, size) = meta_property(data)?;
    if size < HASH_SIZE as u64 {
        return Err(bad("metadata shorter than a measurement"));
    }
    let mut hash = [0u8; HASH_SIZE];
    hash.copy_from_slice(slice(data, offset, HASH_SIZE as u64)?);
    Ok(hash)
}

pub fn read_measurement(path: &Path) -> Result<Hash, TeeError> {
    let data = std::fs::read(path)?;
    if data.is_empty() {
        return Err(bad(format!("{} is empty", path.display())));
    }
    measurement_of(&data)
}

/// Minimal ELF64 image carrying only the measurement note
pub fn build_image(measurement: &Hash) -> Vec<u8> {
    let mut note = Vec::new();
    let name = format!("{}\0", META_NOTE_NAME);
    note.extend_from_slice(&(name.len() as u32).to_le_bytes());
    note.extend_from_slice(&(HASH_SIZE as u32).to_le_bytes());
    note.extend_from_slice(&1u32.to_le_bytes());
    note.extend_from_slice(name.as_bytes());
    note.extend_from_slice(measurement);

    let strtab = format!("\0{}\0.shstrtab\0", META_SECTION);
    let note_offset = ELF_HEADER_SIZE;
    let strtab_offset = note_offset + note.len();
    let shoff = (strtab_offset + strtab.len()).next_multiple_of(8);

    let mut image = vec![0u8; shoff + 3 * SECTION_HEADER_SIZE];
    image[..4].copy_from_slice(ELF_MAGIC);
    image[4] = 2; // ELFCLASS64
    image[5] = 1; // little endian
    image[6] = 1;
    image[16..18].copy_from_slice(&3u16.to_le_bytes()); // ET_DYN
    image[18..20].copy_from_slice(&0xF3u16.to_le_bytes()); // RISC-V
    image[20..24].copy_from_slice(&1u32.to_le_bytes());
    image[0x28..0x30].copy_from_slice(&(shoff as u64).to_le_bytes());
    image[0x34..0x36].copy_from_slice(&(ELF_HEADER_SIZE as u16).to_le_bytes());
    image[0x3A..0x3C].copy_from_slice(&(SECTION_HEADER_SIZE as u16).to_le_bytes());
    image[0x3C..0x3E].copy_from_slice(&3u16.to_le_bytes());
    image[0x3E..0x40].copy_from_slice(&2u16.to_le_bytes());

    image[note_offset..strtab_offset].copy_from_slice(&note);
    image[strtab_offset..strtab_offset + strtab.len()].copy_from_slice(strtab.as_bytes());

    let mut put_section = |index: usize, name: u32, kind: u32, offset: usize, size: usize| {
        let sh = shoff + index * SECTION_HEADER_SIZE;
        image[sh..sh + 4].copy_from_slice(&name.to_le_bytes());
        image[sh + 4..sh + 8].copy_from_slice(&kind.to_le_bytes());
        image[sh + 24..sh + 32].copy_from_slice(&(offset as u64).to_le_bytes());
        image[sh + 32..sh + 40].copy_from_slice(&(size as u64).to_le_bytes());
        image[sh + 48..sh + 56].copy_from_slice(&1u64.to_le_bytes());
    };
    put_section(1, 1, SHT_NOTE, note_offset, note.len());
    put_section(
        2,
        1 + META_SECTION.len() as u32 + 1,
        SHT_STRTAB,
        strtab_offset,
        strtab.len(),
    );

    image
}

/// Write an image for `name` into `dir`, returning its path
pub fn write_image(dir: &Path, name: &str, measurement: &Hash) -> Result<PathBuf, TeeError> {
    let path = image_path(dir, name);
    std::fs::write(&path, build_image(measurement))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_built_image_roundtrip() {
        let measurement = [0x5Au8; 32];
        let image = build_image(&measurement);
        assert_eq!(measurement_of(&image).unwrap(), measurement);
    }

    #[test]
    fn test_on_disk_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path(), "echo", &[7u8; 32]).unwrap();
        assert!(path.ends_with("echo.signed.so"));
        assert_eq!(read_measurement(&path).unwrap(), [7u8; 32]);
    }

    #[test]
    fn test_image_path() {
        let dir = Path::new("/enclaves");
        assert_eq!(image_path(dir, "echo"), PathBuf::from("/enclaves/echo.signed.so"));
        assert_eq!(image_path(dir, "./x.signed.so"), PathBuf::from("./x.signed.so"));
    }

    #[test]
    fn test_rejects_non_elf() {
        assert!(measurement_of(b"definitely not an elf image, long enough to hold a header....").is_err());
        assert!(measurement_of(&[]).is_err());
    }

    fn elf_header(shoff: u64, shentsize: u16, shnum: u16, shstrndx: u16) -> Vec<u8> {
        let mut data = vec![0u8; 128];
        data[..4].copy_from_slice(ELF_MAGIC);
        data[4] = 2;
        data[0x28..0x30].copy_from_slice(&shoff.to_le_bytes());
        data[0x3A..0x3C].copy_from_slice(&shentsize.to_le_bytes());
        data[0x3C..0x3E].copy_from_slice(&shnum.to_le_bytes());
        data[0x3E..0x40].copy_from_slice(&shstrndx.to_le_bytes());
        data
    }

    #[test]
    fn test_huge_section_offset_is_rejected() {
        let data = elf_header(u64::MAX - 10, 64, 1, 0);
        assert!(matches!(meta_property(&data), Err(TeeError::ImageError(_))));

        let data = elf_header(u64::MAX - 10, 64, 3, 2);
        assert!(measurement_of(&data).is_err());
    }

    #[test]
    fn test_hostile_image_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hostile.signed.so");
        std::fs::write(&path, elf_header(u64::MAX - 10, 64, 1, 0)).unwrap();
        assert!(read_measurement(&path).is_err());
    }

    #[test]
    fn test_rejects_wrong_note_name() {
        let mut image = build_image(&[1u8; 32]);
        // First byte of the note name
        image[ELF_HEADER_SIZE + NOTE_HEADER_SIZE] = b'x';
        assert!(matches!(measurement_of(&image), Err(TeeError::ImageError(_))));
    }

    #[test]
    fn test_rejects_bad_section_size() {
        let mut image = build_image(&[1u8; 32]);
        let shoff = u64_at(&image, 0x28).unwrap() as usize;
        let size_field = shoff + SECTION_HEADER_SIZE + 32;
        image[size_field] += 1;
        assert!(measurement_of(&image).is_err());
    }

    #[test]
    fn test_truncated_image() {
        let image = build_image(&[1u8; 32]);
        assert!(measurement_of(&image[..100]).is_err());
    }
}
