/*
 * Legacy 8259 Programmable Interrupt Controller
 *
 * The two cascaded PICs are remapped so IRQ 0-15 land on vectors 32-47,
 * clear of the CPU exception range. Only the PIT line (IRQ0) is unmasked;
 * the kernel core consumes no other legacy interrupt source.
 */

use pic8259::ChainedPics;
use spin::Mutex;

use super::vectors;

const PIC_1_OFFSET: u8 = vectors::IRQ_BASE;
const PIC_2_OFFSET: u8 = vectors::IRQ_BASE + 8;

static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Remap the PICs and mask every line except the timer.
pub fn init() {
    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();
        // Unmask IRQ0 (PIT) on the master; mask the whole slave.
        pics.write_masks(0xFE, 0xFF);
    }
    log::info!("PIC remapped to vectors {}-{}", PIC_1_OFFSET, PIC_2_OFFSET + 7);
}

/// Signal end-of-interrupt for a legacy vector.
pub fn end_of_interrupt(vector: u8) {
    unsafe {
        PICS.lock().notify_end_of_interrupt(vector);
    }
}

/// Mask one legacy line (0-15).
pub fn mask_line(line: u8) {
    unsafe {
        let mut pics = PICS.lock();
        let [mut m1, mut m2] = pics.read_masks();
        if line < 8 {
            m1 |= 1 << line;
        } else {
            m2 |= 1 << (line - 8);
        }
        pics.write_masks(m1, m2);
    }
}

/// Unmask one legacy line (0-15).
pub fn unmask_line(line: u8) {
    unsafe {
        let mut pics = PICS.lock();
        let [mut m1, mut m2] = pics.read_masks();
        if line < 8 {
            m1 &= !(1 << line);
        } else {
            m2 &= !(1 << (line - 8));
        }
        pics.write_masks(m1, m2);
    }
}

/// True if the vector belongs to the remapped legacy range.
pub fn handles_vector(vector: u8) -> bool {
    (PIC_1_OFFSET..PIC_1_OFFSET + 16).contains(&vector)
}
