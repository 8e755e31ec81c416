mod system;
mod code;

pub use system::{
    OS_PAGE_SIZE, map_executable_memory, page_align, unmap_memory,
};
pub use code::CodeBlob;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_alignment() {
        assert_eq!(page_align(1), OS_PAGE_SIZE);
        assert_eq!(page_align(OS_PAGE_SIZE), OS_PAGE_SIZE);
        assert_eq!(page_align(OS_PAGE_SIZE + 1), 2 * OS_PAGE_SIZE);
    }

    #[test]
    fn executable_mapping_is_writable() {
        let ptr = map_executable_memory(OS_PAGE_SIZE).expect("mmap");
        // SAFETY: freshly mapped read/write/execute page
        unsafe {
            ptr.as_ptr().write(0xC3);
            assert_eq!(ptr.as_ptr().read(), 0xC3);
        }
        unmap_memory(ptr, OS_PAGE_SIZE);
    }

    #[test]
    fn blob_appends_bump_the_cursor() {
        let mut blob = CodeBlob::new(100).expect("blob");
        assert_eq!(blob.capacity(), OS_PAGE_SIZE);

        let a = blob.append(&[0xC3]).unwrap();
        let b = blob.append(&[0x90, 0x90, 0xC3]).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(blob.used(), 4);
        assert_eq!(blob.bytes(b, 3), Some(&[0x90, 0x90, 0xC3][..]));
        assert_eq!(blob.bytes(b, 4), None);
        assert_eq!(blob.entry(b) as usize - blob.entry(a) as usize, 1);
    }

    #[test]
    fn full_blob_refuses_append() {
        let mut blob = CodeBlob::new(OS_PAGE_SIZE).unwrap();
        let chunk = vec![0xCC; OS_PAGE_SIZE - 8];
        let first = blob.append(&chunk).unwrap();
        assert!(!blob.fits(16));
        assert_eq!(blob.append(&[0; 16]), None);
        // earlier code is untouched by the failed append
        assert_eq!(blob.bytes(first, chunk.len()), Some(&chunk[..]));
        assert_eq!(blob.append(&[0; 8]), Some(OS_PAGE_SIZE - 8));
        assert_eq!(blob.remaining(), 0);
    }
}
