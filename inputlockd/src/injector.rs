use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, RwLock};
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

// Linux input event types and codes
const EV_SYN: u16 = 0x00;
const EV_KEY: u16 = 0x01;
const EV_REL: u16 = 0x02;
const EV_ABS: u16 = 0x03;
const SYN_REPORT: u16 = 0x00;
const REL_X: u16 = 0x00;
const REL_Y: u16 = 0x01;
const REL_WHEEL: u16 = 0x08;
const ABS_X: u16 = 0x00;
const ABS_Y: u16 = 0x01;

const KEY_LEFTSHIFT: u16 = 42;
const BTN_LEFT: u16 = 272;
const BTN_TASK: u16 = 279;

// uinput ioctls
const UI_SET_EVBIT: u64 = 0x40045564;
const UI_SET_KEYBIT: u64 = 0x40045565;
const UI_SET_RELBIT: u64 = 0x40045566;
const UI_SET_ABSBIT: u64 = 0x40045567;
const UI_DEV_CREATE: u64 = 0x5501;
const UI_DEV_DESTROY: u64 = 0x5502;

const DEVICE_NAME: &[u8] = b"Inputlock Virtual Output";

/// Range advertised for the absolute cursor axes.
const ABS_RANGE_MAX: i32 = 65535;

/// Inter-keystroke pacing for type_string, in milliseconds.
const TYPE_HOLD_MS: u64 = 20;
const TYPE_GAP_MS: u64 = 30;

// US QWERTY layout, row by row: each row is (characters, code of the first)
const KEY_ROWS: [(&str, u16); 4] = [
    ("1234567890", 2),
    ("qwertyuiop", 16),
    ("asdfghjkl", 30),
    ("zxcvbnm", 44),
];

// Unshifted punctuation and whitespace
const KEY_PUNCT: [(char, u16); 14] = [
    (' ', 57),
    ('-', 12),
    ('=', 13),
    ('[', 26),
    (']', 27),
    ('\\', 43),
    (';', 39),
    ('\'', 40),
    ('`', 41),
    (',', 51),
    ('.', 52),
    ('/', 53),
    ('\n', 28),
    ('\t', 15),
];

// Shifted symbol -> the unshifted character on the same key
const SHIFT_PAIRS: [(char, char); 21] = [
    ('!', '1'),
    ('@', '2'),
    ('#', '3'),
    ('$', '4'),
    ('%', '5'),
    ('^', '6'),
    ('&', '7'),
    ('*', '8'),
    ('(', '9'),
    (')', '0'),
    ('_', '-'),
    ('+', '='),
    ('{', '['),
    ('}', ']'),
    ('|', '\\'),
    (':', ';'),
    ('"', '\''),
    ('~', '`'),
    ('<', ','),
    ('>', '.'),
    ('?', '/'),
];

/// struct input_event from <linux/input.h>
#[repr(C)]
#[derive(Clone, Copy)]
struct KernelInputEvent {
    time: libc::timeval,
    type_: u16,
    code: u16,
    value: i32,
}

/// struct uinput_user_dev from <linux/uinput.h>
#[repr(C)]
struct UinputUserDev {
    name: [u8; 80],
    id: InputId,
    ff_effects_max: u32,
    absmax: [i32; 64],
    absmin: [i32; 64],
    absfuzz: [i32; 64],
    absflat: [i32; 64],
}

#[repr(C)]
struct InputId {
    bustype: u16,
    vendor: u16,
    product: u16,
    version: u16,
}

/// Input synthesis used by the macro player.
#[async_trait::async_trait]
pub trait Injector: Send + Sync {
    async fn initialize(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    async fn key_press(&self, key_code: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    async fn key_release(&self, key_code: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    async fn mouse_press(&self, button: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    async fn mouse_release(&self, button: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    async fn mouse_move_abs(&self, x: i32, y: i32) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    async fn mouse_scroll(&self, amount: i32) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
    async fn type_string(&self, text: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Uinput-backed virtual output device.
///
/// Serves two roles: the hook re-emits pass-verdict events through it, and
/// the player synthesizes playback input on it. Clones share one device;
/// the device is torn down when the last clone drops.
#[derive(Clone)]
pub struct UinputInjector {
    fd: Arc<RwLock<Option<RawFd>>>,
    // char -> (key code, needs shift)
    layout: Arc<HashMap<char, (u16, bool)>>,
}

impl UinputInjector {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        Ok(Self {
            fd: Arc::new(RwLock::new(None)),
            layout: Arc::new(build_layout()),
        })
    }

    /// Create the virtual device. Idempotent; later calls are no-ops.
    pub async fn initialize(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if self.fd.read().unwrap().is_some() {
            return Ok(());
        }

        let file = OpenOptions::new().write(true).open("/dev/uinput").map_err(|e| {
            format!("failed to open /dev/uinput (root and the uinput module are required): {}", e)
        })?;
        let fd = file.as_raw_fd();
        // The fd outlives the File handle; Drop closes it explicitly
        mem::forget(file);

        enable_capabilities(fd)?;
        register_device(fd)?;
        info!("Created uinput device '{}'", String::from_utf8_lossy(DEVICE_NAME));

        *self.fd.write().unwrap() = Some(fd);

        // Give udev a moment to expose the new node
        sleep(Duration::from_millis(100)).await;
        Ok(())
    }

    fn current_fd(&self) -> Result<RawFd, Box<dyn std::error::Error + Send + Sync>> {
        self.fd
            .read()
            .unwrap()
            .ok_or_else(|| "uinput device not initialized".into())
    }

    async fn ensure_ready(&self) -> Result<RawFd, Box<dyn std::error::Error + Send + Sync>> {
        if self.fd.read().unwrap().is_none() {
            self.initialize().await?;
        }
        self.current_fd()
    }

    /// Re-emit one intercepted event verbatim. Runs on the hook's reader
    /// threads, so it stays synchronous and never blocks.
    pub fn forward_raw(
        &self,
        type_: u16,
        code: u16,
        value: i32,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        emit(self.current_fd()?, type_, code, value)?;
        Ok(())
    }

    pub async fn key_press(&self, key_code: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let fd = self.ensure_ready().await?;
        debug!("key {} down", key_code);
        emit(fd, EV_KEY, key_code, 1)?;
        report(fd)?;
        Ok(())
    }

    pub async fn key_release(&self, key_code: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let fd = self.ensure_ready().await?;
        debug!("key {} up", key_code);
        emit(fd, EV_KEY, key_code, 0)?;
        report(fd)?;
        Ok(())
    }

    pub async fn mouse_press(&self, button: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let fd = self.ensure_ready().await?;
        debug!("button {} down", button);
        emit(fd, EV_KEY, button, 1)?;
        report(fd)?;
        Ok(())
    }

    pub async fn mouse_release(&self, button: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let fd = self.ensure_ready().await?;
        debug!("button {} up", button);
        emit(fd, EV_KEY, button, 0)?;
        report(fd)?;
        Ok(())
    }

    /// Position the cursor via the absolute axes.
    pub async fn mouse_move_abs(&self, x: i32, y: i32) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let fd = self.ensure_ready().await?;
        emit(fd, EV_ABS, ABS_X, x.clamp(0, ABS_RANGE_MAX))?;
        emit(fd, EV_ABS, ABS_Y, y.clamp(0, ABS_RANGE_MAX))?;
        report(fd)?;
        Ok(())
    }

    pub async fn mouse_scroll(&self, amount: i32) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let fd = self.ensure_ready().await?;
        emit(fd, EV_REL, REL_WHEEL, amount)?;
        report(fd)?;
        Ok(())
    }

    /// Type text character by character using the US layout table.
    pub async fn type_string(&self, text: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.ensure_ready().await?;

        for c in text.chars() {
            let (code, shifted) = match self.layout.get(&c) {
                Some(entry) => *entry,
                None => {
                    warn!("no key mapping for '{}' (U+{:04X}), skipping", c, c as u32);
                    continue;
                }
            };

            if shifted {
                self.key_press(KEY_LEFTSHIFT).await?;
            }
            self.key_press(code).await?;
            sleep(Duration::from_millis(TYPE_HOLD_MS)).await;
            self.key_release(code).await?;
            if shifted {
                self.key_release(KEY_LEFTSHIFT).await?;
            }
            sleep(Duration::from_millis(TYPE_GAP_MS)).await;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Injector for UinputInjector {
    async fn initialize(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        UinputInjector::initialize(self).await
    }

    async fn key_press(&self, key_code: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        UinputInjector::key_press(self, key_code).await
    }

    async fn key_release(&self, key_code: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        UinputInjector::key_release(self, key_code).await
    }

    async fn mouse_press(&self, button: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        UinputInjector::mouse_press(self, button).await
    }

    async fn mouse_release(&self, button: u16) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        UinputInjector::mouse_release(self, button).await
    }

    async fn mouse_move_abs(&self, x: i32, y: i32) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        UinputInjector::mouse_move_abs(self, x, y).await
    }

    async fn mouse_scroll(&self, amount: i32) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        UinputInjector::mouse_scroll(self, amount).await
    }

    async fn type_string(&self, text: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        UinputInjector::type_string(self, text).await
    }
}

impl Drop for UinputInjector {
    fn drop(&mut self) {
        // Clones share the fd; only the last owner tears the device down
        if Arc::strong_count(&self.fd) != 1 {
            return;
        }
        if let Ok(guard) = self.fd.try_read() {
            if let Some(fd) = *guard {
                info!("Destroying uinput device");
                unsafe {
                    libc::ioctl(fd, UI_DEV_DESTROY);
                    libc::close(fd);
                }
            }
        }
    }
}

fn build_layout() -> HashMap<char, (u16, bool)> {
    let mut layout = HashMap::new();
    for (row, base) in KEY_ROWS {
        for (i, c) in row.chars().enumerate() {
            let code = base + i as u16;
            layout.insert(c, (code, false));
            if c.is_ascii_lowercase() {
                layout.insert(c.to_ascii_uppercase(), (code, true));
            }
        }
    }
    for (c, code) in KEY_PUNCT {
        layout.insert(c, (code, false));
    }
    for (shifted, base) in SHIFT_PAIRS {
        if let Some(&(code, _)) = layout.get(&base) {
            layout.insert(shifted, (code, true));
        }
    }
    layout
}

fn set_bit(fd: RawFd, request: u64, bit: u16) -> io::Result<()> {
    let result = unsafe { libc::ioctl(fd, request, bit as libc::c_int) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Advertise key, relative, and absolute capabilities.
fn enable_capabilities(fd: RawFd) -> io::Result<()> {
    for ev in [EV_SYN, EV_KEY, EV_REL, EV_ABS] {
        set_bit(fd, UI_SET_EVBIT, ev)?;
    }
    // Full keyboard range plus the mouse buttons
    for key in 0..256u16 {
        set_bit(fd, UI_SET_KEYBIT, key)?;
    }
    for btn in BTN_LEFT..=BTN_TASK {
        set_bit(fd, UI_SET_KEYBIT, btn)?;
    }
    for axis in [REL_X, REL_Y, REL_WHEEL] {
        set_bit(fd, UI_SET_RELBIT, axis)?;
    }
    for axis in [ABS_X, ABS_Y] {
        set_bit(fd, UI_SET_ABSBIT, axis)?;
    }
    Ok(())
}

/// Write the device record and create the node.
fn register_device(fd: RawFd) -> io::Result<()> {
    let mut dev: UinputUserDev = unsafe { mem::zeroed() };
    dev.name[..DEVICE_NAME.len()].copy_from_slice(DEVICE_NAME);
    dev.id.bustype = 0x03; // BUS_USB
    dev.id.vendor = 0x0001;
    dev.id.product = 0xFFFF;
    dev.id.version = 1;
    dev.absmax[ABS_X as usize] = ABS_RANGE_MAX;
    dev.absmax[ABS_Y as usize] = ABS_RANGE_MAX;

    let written = unsafe {
        libc::write(
            fd,
            &dev as *const UinputUserDev as *const libc::c_void,
            mem::size_of::<UinputUserDev>(),
        )
    };
    if written < 0 {
        return Err(io::Error::last_os_error());
    }

    let result = unsafe { libc::ioctl(fd, UI_DEV_CREATE) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Write one event frame to the device.
fn emit(fd: RawFd, type_: u16, code: u16, value: i32) -> io::Result<()> {
    let mut event: KernelInputEvent = unsafe { mem::zeroed() };
    unsafe {
        libc::gettimeofday(&mut event.time, std::ptr::null_mut());
    }
    event.type_ = type_;
    event.code = code;
    event.value = value;

    let written = unsafe {
        libc::write(
            fd,
            &event as *const KernelInputEvent as *const libc::c_void,
            mem::size_of::<KernelInputEvent>(),
        )
    };
    if written < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Close the frame with a SYN_REPORT so consumers deliver it.
fn report(fd: RawFd) -> io::Result<()> {
    emit(fd, EV_SYN, SYN_REPORT, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_covers_letters_and_digits() {
        let layout = build_layout();
        assert_eq!(layout.get(&'a'), Some(&(30, false)));
        assert_eq!(layout.get(&'A'), Some(&(30, true)));
        assert_eq!(layout.get(&'1'), Some(&(2, false)));
        assert_eq!(layout.get(&' '), Some(&(57, false)));
    }

    #[test]
    fn test_layout_shifted_symbols_share_codes() {
        let layout = build_layout();
        // '!' is shift+'1'
        assert_eq!(layout.get(&'!'), Some(&(2, true)));
        assert_eq!(layout.get(&'?'), Some(&(53, true)));
        assert_eq!(layout.get(&'"'), Some(&(40, true)));
    }

    #[tokio::test]
    async fn test_uninitialized_forward_fails() {
        let injector = UinputInjector::new().unwrap();
        assert!(injector.forward_raw(EV_KEY, 30, 1).is_err());
    }
}
