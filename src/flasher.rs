//! Firmware deployment to a device in SAM-BA bootloader mode.
//!
//! The bootloader enumerates as a CDC device and speaks the SAM-BA monitor
//! protocol over its bulk pipe: ASCII commands to read/write memory, plus
//! flash-controller register pokes to commit pages and select the boot
//! source. The image is written page by page into the flash latch and
//! committed with erase-and-write-page commands; afterwards the part is
//! pointed at flash and reset.
//!
//! A flash aborted halfway can leave the target unbootable until it is
//! power-cycled back into the bootloader, which is why every fault here is
//! its own error type rather than a generic transport error.

use rusb::{Context, DeviceHandle};
use std::thread;
use std::time::Duration;

const SAMBA_TIMEOUT: Duration = Duration::from_secs(1);

/// CDC communication interface of the bootloader.
const COMM_INTERFACE: u8 = 0;
/// CDC data interface carrying the bulk monitor pipe.
const DATA_INTERFACE: u8 = 1;
const EP_OUT: u8 = 0x01;
const EP_IN: u8 = 0x82;

// SAM3 flash geometry and enhanced-flash-controller registers.
const FLASH_BASE: u32 = 0x0008_0000;
const PAGE_SIZE: usize = 256;
const MAX_IMAGE_BYTES: usize = 256 * 1024;
const EFC_FCR: u32 = 0x400E_0804;
const EFC_FSR: u32 = 0x400E_0808;
const FSR_READY: u32 = 1;
const FLASH_KEY: u32 = 0x5A;
const CMD_ERASE_WRITE_PAGE: u32 = 0x03;
const CMD_SET_GPNVM: u32 = 0x0B;
const GPNVM_BOOT_FROM_FLASH: u32 = 1;
// Cortex-M application interrupt and reset control register.
const AIRCR: u32 = 0xE000_ED0C;
const AIRCR_SYSRESET: u32 = 0x05FA_0004;

#[derive(Debug, thiserror::Error)]
pub enum FlashError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("No device in bootloader mode was found")]
    NoTarget,

    #[error("Firmware image is empty")]
    EmptyImage,

    #[error("Firmware image of {size} bytes exceeds the {MAX_IMAGE_BYTES} byte flash")]
    ImageTooLarge { size: usize },

    #[error("Bootloader handshake failed")]
    Handshake,

    #[error("Flash controller did not become ready")]
    FlashBusy,
}

/// Transfer `image` to a device in bootloader mode.
pub(crate) fn flash(usb_dev: &rusb::Device<Context>, image: &[u8]) -> Result<(), FlashError> {
    if image.is_empty() {
        return Err(FlashError::EmptyImage);
    }
    if image.len() > MAX_IMAGE_BYTES {
        return Err(FlashError::ImageTooLarge { size: image.len() });
    }

    let handle = usb_dev.open()?;
    #[cfg(target_os = "linux")]
    {
        // The CDC interfaces are usually bound by the ACM driver.
        for iface in [COMM_INTERFACE, DATA_INTERFACE] {
            if handle.kernel_driver_active(iface).unwrap_or(false) {
                log::debug!("Detaching kernel driver from interface {}", iface);
                if let Err(e) = handle.detach_kernel_driver(iface) {
                    log::warn!("Failed to detach kernel driver: {}", e);
                }
            }
        }
    }
    handle.claim_interface(COMM_INTERFACE)?;
    handle.claim_interface(DATA_INTERFACE)?;

    enter_binary_mode(&handle)?;

    let pages = image.chunks(PAGE_SIZE).count();
    log::info!("Flashing {} bytes ({} pages)", image.len(), pages);
    for (page, chunk) in image.chunks(PAGE_SIZE).enumerate() {
        let addr = FLASH_BASE + (page * PAGE_SIZE) as u32;
        load_latch(&handle, addr, chunk)?;
        write_word(&handle, EFC_FCR, ewp_command(page as u32))?;
        wait_flash_ready(&handle)?;
        if page % 64 == 0 {
            log::debug!("Flashed page {}/{}", page, pages);
        }
    }

    // Boot from flash and reset into the fresh firmware.
    write_word(&handle, EFC_FCR, gpnvm_command(GPNVM_BOOT_FROM_FLASH))?;
    wait_flash_ready(&handle)?;
    if let Err(e) = write_word(&handle, AIRCR, AIRCR_SYSRESET) {
        // The part resets while acknowledging; a broken pipe here is fine.
        log::debug!("Reset request ended with: {}", e);
    }

    for iface in [DATA_INTERFACE, COMM_INTERFACE] {
        let _ = handle.release_interface(iface);
    }
    Ok(())
}

/// Erase-and-write-page command word for the flash controller.
const fn ewp_command(page: u32) -> u32 {
    (FLASH_KEY << 24) | (page << 8) | CMD_ERASE_WRITE_PAGE
}

/// Set-GPNVM-bit command word.
const fn gpnvm_command(bit: u32) -> u32 {
    (FLASH_KEY << 24) | (bit << 8) | CMD_SET_GPNVM
}

/// Switch the monitor from terminal to binary mode.
fn enter_binary_mode(handle: &DeviceHandle<Context>) -> Result<(), FlashError> {
    send_command(handle, "N#")?;
    let mut ack = [0u8; 2];
    match handle.read_bulk(EP_IN, &mut ack, SAMBA_TIMEOUT) {
        Ok(n) if n > 0 => Ok(()),
        Ok(_) | Err(rusb::Error::Timeout) => Err(FlashError::Handshake),
        Err(e) => Err(e.into()),
    }
}

/// Write `data` into the page latch at `addr` with an S command.
fn load_latch(
    handle: &DeviceHandle<Context>,
    addr: u32,
    data: &[u8],
) -> Result<(), FlashError> {
    send_command(handle, &format!("S{:08X},{:08X}#", addr, data.len()))?;
    handle.write_bulk(EP_OUT, data, SAMBA_TIMEOUT)?;
    // A short page still erases and writes a full one; the latch keeps the
    // previous contents for the padding bytes, which is harmless for the
    // final page.
    Ok(())
}

fn write_word(handle: &DeviceHandle<Context>, addr: u32, value: u32) -> Result<(), FlashError> {
    send_command(handle, &format!("W{:08X},{:08X}#", addr, value))
}

fn read_word(handle: &DeviceHandle<Context>, addr: u32) -> Result<u32, FlashError> {
    send_command(handle, &format!("w{:08X},4#", addr))?;
    let mut word = [0u8; 4];
    let n = handle.read_bulk(EP_IN, &mut word, SAMBA_TIMEOUT)?;
    if n < 4 {
        return Err(FlashError::Handshake);
    }
    Ok(u32::from_le_bytes(word))
}

fn wait_flash_ready(handle: &DeviceHandle<Context>) -> Result<(), FlashError> {
    for _ in 0..50 {
        if read_word(handle, EFC_FSR)? & FSR_READY != 0 {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(5));
    }
    Err(FlashError::FlashBusy)
}

fn send_command(handle: &DeviceHandle<Context>, command: &str) -> Result<(), FlashError> {
    handle.write_bulk(EP_OUT, command.as_bytes(), SAMBA_TIMEOUT)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ewp_command_layout() {
        assert_eq!(ewp_command(0), 0x5A00_0003);
        assert_eq!(ewp_command(1), 0x5A00_0103);
        assert_eq!(ewp_command(511), 0x5A01_FF03);
    }

    #[test]
    fn test_gpnvm_command_layout() {
        assert_eq!(gpnvm_command(1), 0x5A00_010B);
    }

    #[test]
    fn test_page_math_covers_partial_tail() {
        let image = vec![0u8; PAGE_SIZE * 3 + 17];
        let pages: Vec<&[u8]> = image.chunks(PAGE_SIZE).collect();
        assert_eq!(pages.len(), 4);
        assert_eq!(pages[3].len(), 17);
    }
}
