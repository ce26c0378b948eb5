//! Helpers to build layer archives in tests.

/// Builds a tar archive with a single file entry using the given path and
/// content. This bypasses `tar::Builder`'s path validation, allowing paths
/// like "../" or "/absolute".
pub fn raw_tar_file(path: &[u8], content: &[u8]) -> Vec<u8> {
    let mut archive_data = Vec::new();

    // Build tar header manually (512 bytes)
    let mut header = [0u8; 512];

    // Name field (0-99)
    let path_len = path.len().min(100);
    header[..path_len].copy_from_slice(&path[..path_len]);

    // Mode (100-107) - 0644 in octal
    header[100..107].copy_from_slice(b"0000644");
    // UID (108-115)
    header[108..115].copy_from_slice(b"0000000");
    // GID (116-123)
    header[116..123].copy_from_slice(b"0000000");
    // Size (124-135) in octal
    let size_str = format!("{:011o}", content.len());
    header[124..135].copy_from_slice(size_str.as_bytes());
    // Mtime (136-147)
    header[136..147].copy_from_slice(b"00000000000");
    // Type flag (156) - '0' for regular file
    header[156] = b'0';
    // Magic (257-262)
    header[257..262].copy_from_slice(b"ustar");
    // Version (263-264)
    header[263..265].copy_from_slice(b"00");

    // Calculate checksum
    header[148..156].copy_from_slice(b"        ");
    let checksum: u32 = header.iter().map(|&b| u32::from(b)).sum();
    let checksum_str = format!("{checksum:06o}\0 ");
    header[148..156].copy_from_slice(checksum_str.as_bytes());

    archive_data.extend_from_slice(&header);

    // Add content (padded to 512-byte blocks)
    archive_data.extend_from_slice(content);
    let padding = (512 - (content.len() % 512)) % 512;
    archive_data.extend(std::iter::repeat_n(0u8, padding));

    // Add two empty blocks to end archive
    archive_data.extend_from_slice(&[0u8; 1024]);

    archive_data
}

/// Accumulates entries of a layer archive in memory.
pub struct LayerBuilder {
    builder: tar::Builder<Vec<u8>>,
}

impl LayerBuilder {
    pub fn new() -> Self {
        Self {
            builder: tar::Builder::new(Vec::new()),
        }
    }

    pub fn file(self, path: &str, content: &[u8]) -> Self {
        self.file_with_mode(path, content, 0o644)
    }

    pub fn file_with_mode(mut self, path: &str, content: &[u8], mode: u32) -> Self {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(content.len() as u64);
        header.set_mode(mode);
        header.set_mtime(1_700_000_000);
        self.builder
            .append_data(&mut header, path, content)
            .unwrap();
        self
    }

    pub fn dir(self, path: &str) -> Self {
        self.dir_with_mode(path, 0o755)
    }

    pub fn dir_with_mode(mut self, path: &str, mode: u32) -> Self {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(mode);
        self.builder
            .append_data(&mut header, path, std::io::empty())
            .unwrap();
        self
    }

    pub fn symlink(mut self, path: &str, target: &str) -> Self {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Symlink);
        header.set_size(0);
        header.set_mode(0o777);
        self.builder
            .append_link(&mut header, path, target)
            .unwrap();
        self
    }

    pub fn hard_link(mut self, path: &str, target: &str) -> Self {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Link);
        header.set_size(0);
        header.set_mode(0o644);
        self.builder
            .append_link(&mut header, path, target)
            .unwrap();
        self
    }

    pub fn whiteout(self, path: &str) -> Self {
        self.file(path, b"")
    }

    pub fn finish(self) -> Vec<u8> {
        self.builder.into_inner().unwrap()
    }
}
