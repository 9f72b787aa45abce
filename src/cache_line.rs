
/// Pads and aligns a value to the size of a cache line,
/// so that the claim flags of two shards never share a line
#[cfg_attr(
    any(
        target_arch = "mips",
        target_arch = "arm",
        target_arch = "aarch64",
    ),
    repr(align(32))
)]
#[cfg_attr(
    any(
        target_arch = "x86",
        target_arch = "powerpc",
    ),
    repr(align(64))
)]
#[cfg_attr(
    any(
        target_arch = "x86_64",
        target_arch = "powerpc64",
    ),
    repr(align(128))
)]
#[cfg_attr(any(target_arch = "s390x"), repr(align(256)))]
#[derive(Debug)]
pub(crate) struct CacheAligned<T>(T);

impl<T> CacheAligned<T> {
    pub fn new(value: T) -> CacheAligned<T> {
        CacheAligned(value)
    }
}

impl<T> std::ops::Deref for CacheAligned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> std::ops::DerefMut for CacheAligned<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}
