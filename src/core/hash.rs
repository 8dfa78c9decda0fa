//! 内容摘要（BLAKE3）

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

const READ_BUF_SIZE: usize = 64 * 1024;

/// 计算字节内容的摘要
pub fn calculate_hash(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// 流式计算任意读取源的摘要
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// 计算文件摘要，不会把整个文件读入内存
pub fn hash_file(path: &Path) -> io::Result<String> {
    hash_reader(File::open(path)?)
}
