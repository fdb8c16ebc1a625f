/*
 * Serial Print Macros
 *
 * Raw formatted output to the serial console, for the short window before
 * the logger is installed and for panic reporting. Everything after boot
 * should go through the log crate instead.
 */

/// Print to the serial console without a trailing newline.
#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::drivers::serial::print(format_args!($($arg)*))
    };
}

/// Print to the serial console with a trailing newline.
#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => ($crate::serial_print!("{}\n", format_args!($($arg)*)));
}
