#[macro_export]
macro_rules! BIT {
    ( $x:expr ) => {
        1 << $x
    };
}

#[macro_export]
macro_rules! BIT_MASK_LEN {
    ( $x:expr ) => {
        $crate::BIT!($x) - 1
    };
}

// bits range: BIT_RNG(4, 8)  0b000111110000,  start from 4, end at 8
#[macro_export]
macro_rules! BIT_RNG {
    ( $s:expr, $e:expr ) => {
        $crate::BIT_MASK_LEN!($e - $s + 1) << $s
    };
}

/// Extracts the field selected by `mask` from `val`, shifted down to bit 0.
pub const fn get_field(val: u32, mask: u32) -> u32 {
    (val & mask) >> mask.trailing_zeros()
}

/// Returns `val` with the field selected by `mask` replaced by `field`.
pub const fn set_field(val: u32, mask: u32, field: u32) -> u32 {
    (val & !mask) | ((field << mask.trailing_zeros()) & mask)
}
