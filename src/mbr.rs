//! Boot-sector builder for the single-primary-partition layout we
//! write onto destination images.

use std::io;

use bit_field::BitField as _;
use log::debug;
use num_traits::ToPrimitive as _;

pub(crate) const SECTOR_SIZE: u64 = 512;

const PART_ENTRY_OFFSET_BYTES: usize = 446;
const PART_ENTRY_SIZE_BYTES: usize = 16;

const HEADS_PER_CYLINDER: u64 = 16;
const SECTORS_PER_TRACK: u64 = 63;

/// FAT32 with LBA addressing
pub(crate) const PART_TYPE_FAT32_LBA: u8 = 0x0c;

/// Native Linux filesystem
pub(crate) const PART_TYPE_LINUX: u8 = 0x83;

/// Byte offset of a partition entry within the boot sector. Partition
/// numbers are 1-based, matching the device naming convention.
pub(crate) fn part_entry_offset(part_num: u32) -> u64 {
    u64::from(part_num - 1) * PART_ENTRY_SIZE_BYTES as u64 + PART_ENTRY_OFFSET_BYTES as u64
}

fn lba_to_chs_bytes(lba: u64) -> [u8; 3] {
    let c = lba / (HEADS_PER_CYLINDER * SECTORS_PER_TRACK);
    let h = (lba / SECTORS_PER_TRACK) % HEADS_PER_CYLINDER;
    let s = (lba % SECTORS_PER_TRACK) + 1;

    if c <= 0x3ff {
        let c_lo = (c & 0xff).to_u8().unwrap_or(0xff);
        let c_hi = ((c >> 8) & 0x3).to_u8().unwrap_or(0x3);
        let h = h.to_u8().unwrap_or(0xff);
        let s = s.to_u8().unwrap_or(0x3f);

        [h, (c_hi << 6) | (s & 0x3f), c_lo]
    } else {
        // Past CHS reach, use the conventional filler tuple.
        [0xfe, 0xff, 0xff]
    }
}

/// Builds a boot sector describing one primary partition running from
/// `start_lba` to the end of the device.
///
/// # Errors
///
/// Returns an [`io::Error`] if the device is too small to hold the
/// partition.
pub(crate) fn boot_sector(
    total_sectors: u64,
    start_lba: u64,
    part_type: u8,
    bootable: bool,
) -> Result<[u8; 512], io::Error> {
    if total_sectors <= start_lba {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "Device is too small for the partition layout",
        ));
    }

    let size_lba = total_sectors - start_lba;
    let end_lba = total_sectors - 1;

    debug!("Partition 1: LBA {start_lba}..={end_lba}, {size_lba} sectors");

    let mut sector = [0_u8; 512];

    let disk_id = rand::random::<u32>();
    debug!("Using Disk Identifier 0x{disk_id:x}");
    sector[440..444].copy_from_slice(&disk_id.to_le_bytes());

    let mut entry = [0_u8; PART_ENTRY_SIZE_BYTES];
    entry[0].set_bit(7, bootable);
    entry[1..4].copy_from_slice(&lba_to_chs_bytes(start_lba));
    entry[4] = part_type;
    entry[5..8].copy_from_slice(&lba_to_chs_bytes(end_lba));
    entry[8..12].copy_from_slice(&start_lba.to_u32().unwrap_or(u32::MAX).to_le_bytes());
    entry[12..16].copy_from_slice(&size_lba.to_u32().unwrap_or(u32::MAX).to_le_bytes());

    sector[PART_ENTRY_OFFSET_BYTES..PART_ENTRY_OFFSET_BYTES + PART_ENTRY_SIZE_BYTES]
        .copy_from_slice(&entry);

    sector[510] = 0x55;
    sector[511] = 0xaa;

    Ok(sector)
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::{boot_sector, part_entry_offset, PART_TYPE_FAT32_LBA};

    const TEST_TOTAL_SECTORS: u64 = 1024 * 1024; // 512 MiB
    const TEST_START_LBA: u64 = 2048;

    #[test]
    fn sector_has_signature_and_disk_id() {
        let sector =
            boot_sector(TEST_TOTAL_SECTORS, TEST_START_LBA, PART_TYPE_FAT32_LBA, true).unwrap();

        assert_eq!(sector[510], 0x55);
        assert_eq!(sector[511], 0xaa);

        let disk_id = u32::from_le_bytes(sector[440..444].try_into().unwrap());
        assert_ne!(disk_id, 0);
    }

    #[test]
    fn entry_spans_device_and_is_bootable() {
        let sector =
            boot_sector(TEST_TOTAL_SECTORS, TEST_START_LBA, PART_TYPE_FAT32_LBA, true).unwrap();

        let entry_base = usize::try_from(part_entry_offset(1)).unwrap();
        assert_eq!(entry_base, 446);

        assert_eq!(sector[entry_base], 0x80);
        assert_eq!(sector[entry_base + 4], PART_TYPE_FAT32_LBA);

        let start = u32::from_le_bytes(sector[entry_base + 8..entry_base + 12].try_into().unwrap());
        let size = u32::from_le_bytes(sector[entry_base + 12..entry_base + 16].try_into().unwrap());

        assert_eq!(u64::from(start), TEST_START_LBA);
        assert_eq!(u64::from(size), TEST_TOTAL_SECTORS - TEST_START_LBA);
    }

    #[test]
    fn non_bootable_entry_has_no_flag() {
        let sector =
            boot_sector(TEST_TOTAL_SECTORS, TEST_START_LBA, PART_TYPE_FAT32_LBA, false).unwrap();

        assert_eq!(sector[446], 0x00);
    }

    #[test]
    fn device_too_small_is_rejected() {
        boot_sector(TEST_START_LBA, TEST_START_LBA, PART_TYPE_FAT32_LBA, true).unwrap_err();
    }
}
