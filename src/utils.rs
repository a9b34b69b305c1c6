/// view a slice of plain values as its bytes
pub(crate) fn as_bytes<T: Copy>(data: &[T]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, std::mem::size_of_val(data)) }
}

/// view a mutable slice of plain values as its bytes
///
/// # Safety
/// every bit pattern written through the returned slice must be a valid `T`
pub(crate) unsafe fn as_bytes_mut<T: Copy>(data: &mut [T]) -> &mut [u8] {
    std::slice::from_raw_parts_mut(data.as_mut_ptr() as *mut u8, std::mem::size_of_val(data))
}

/// reassemble values from bytes produced by [as_bytes]
///
/// # Safety
/// the bytes must hold valid `T`s
pub(crate) unsafe fn from_bytes<T: Copy>(bytes: &[u8]) -> Vec<T> {
    let size = std::mem::size_of::<T>();
    bytes
        .chunks_exact(size)
        .map(|chunk| std::ptr::read_unaligned(chunk.as_ptr() as *const T))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_round_trip() {
        let vals = [1i64, -2, i64::MAX];
        let bytes = as_bytes(&vals);
        assert_eq!(bytes.len(), 24);
        assert_eq!(unsafe { from_bytes::<i64>(bytes) }, vals.to_vec());
        let mut out = [0u16; 2];
        unsafe { as_bytes_mut(&mut out) }.copy_from_slice(&[1, 0, 2, 0][..]);
        assert_eq!(out, [u16::from_ne_bytes([1, 0]), u16::from_ne_bytes([2, 0])]);
    }
}
