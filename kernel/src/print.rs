// Print macros for kernel output

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::arch::riscv64::sbi::_print(format_args!($($arg)*)));
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

// Host target (unit tests): forward to std
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => (std::print!($($arg)*));
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
#[macro_export]
macro_rules! println {
    () => (std::println!());
    ($($arg:tt)*) => (std::println!($($arg)*));
}
