use std::path::Path;

/// Safe wrapper around libc::getuid().
#[allow(unsafe_code)]
fn current_uid() -> u32 {
    // SAFETY: getuid() is always safe — no arguments, no side effects, cannot fail.
    unsafe { libc::getuid() }
}

/// Safe wrapper around libc::getgid().
#[allow(unsafe_code)]
fn current_gid() -> u32 {
    // SAFETY: getgid() is always safe — no arguments, no side effects, cannot fail.
    unsafe { libc::getgid() }
}

/// Identity and platform facts about the invoking host process.
#[derive(Debug, Clone)]
pub struct HostInfo {
    pub uid: u32,
    pub gid: u32,
    pub username: String,
    pub arch: String,
    pub kernel: String,
}

impl HostInfo {
    pub fn detect() -> Self {
        let uid = current_uid();
        let username = std::env::var("USER").unwrap_or_else(|_| {
            if uid == 0 {
                "root".to_owned()
            } else {
                format!("user{uid}")
            }
        });
        Self {
            uid,
            gid: current_gid(),
            username,
            arch: detect_arch(),
            kernel: kernel_version(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }

    /// True when the host kernel is at least `version` ("X.Y.Z").
    pub fn kernel_at_least(&self, version: &str) -> bool {
        compare_kernel(&self.kernel, version) >= std::cmp::Ordering::Equal
    }

    /// `(distribution id, version id)` from /etc/os-release, empty strings
    /// when the file is absent or incomplete.
    pub fn os_distribution(&self) -> (String, String) {
        os_distribution_from(Path::new("/etc/os-release"))
    }
}

fn detect_arch() -> String {
    // proot and fakechroot builds are named after the kernel machine name.
    match std::env::consts::ARCH {
        "x86" => "i386".to_owned(),
        "aarch64" => "aarch64".to_owned(),
        "arm" => "arm".to_owned(),
        other => other.to_owned(), // x86_64, riscv64, ...
    }
}

fn kernel_version() -> String {
    std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|s| s.trim().to_owned())
        .unwrap_or_default()
}

/// Compare two kernel version strings numerically, ignoring any suffix
/// after the numeric triplet ("5.15.0-91-generic" reads as 5.15.0).
fn compare_kernel(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |v: &str| -> [u64; 3] {
        let mut parts = [0u64; 3];
        for (i, comp) in v.split('.').take(3).enumerate() {
            let digits: String = comp.chars().take_while(char::is_ascii_digit).collect();
            parts[i] = digits.parse().unwrap_or(0);
        }
        parts
    };
    parse(a).cmp(&parse(b))
}

/// Distribution facts of a guest rootfs, from its own /etc/os-release.
pub fn guest_distribution(root: &Path) -> (String, String) {
    os_distribution_from(&root.join("etc/os-release"))
}

fn os_distribution_from(path: &Path) -> (String, String) {
    let Ok(content) = std::fs::read_to_string(path) else {
        return (String::new(), String::new());
    };
    let mut id = String::new();
    let mut version = String::new();
    for line in content.lines() {
        if let Some(value) = line.strip_prefix("ID=") {
            id = value.trim_matches('"').to_owned();
        } else if let Some(value) = line.strip_prefix("VERSION_ID=") {
            version = value.trim_matches('"').to_owned();
        }
    }
    (id, version)
}
