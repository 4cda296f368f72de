
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

impl SafeCast<u64> for u32 {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}

impl SafeCast<i64> for u32 {
    fn safe_cast(self) -> i64 {
        self as i64
    }
}

impl SafeCast<u64> for usize {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}


/// For narrowing casts where business logic ensures that the value is in the narrower type's range.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
impl PrecheckedCast<u32> for u64 {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
impl PrecheckedCast<u32> for i64 {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
impl PrecheckedCast<usize> for u64 {
    fn prechecked_cast(self) -> usize {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_cast() {
        let len: u64 = usize::MAX.safe_cast();
        assert_eq!(len, usize::MAX as u64);
        let n: usize = u32::MAX.safe_cast();
        assert_eq!(n, u32::MAX as usize);
    }

    #[test]
    fn test_prechecked_cast() {
        let n: u32 = 17_u64.prechecked_cast();
        assert_eq!(n, 17);
    }

    #[test]
    #[should_panic]
    fn test_prechecked_cast_out_of_range() {
        let _: u32 = (u32::MAX as u64 + 1).prechecked_cast();
    }
}
