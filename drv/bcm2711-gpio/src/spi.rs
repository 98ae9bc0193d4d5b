// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Polled driver for the SoC's primary SPI controller.
//!
//! Channels 0 and 1 are the controller's two chip-select lines. Transfers
//! are full duplex: every clocked-out byte clocks one in, and the FIFO is
//! drained as it fills so transfers longer than the 16-byte FIFO work.

use drv_gpio_api::GpioError;

use crate::mem::MmioBlock;

// Register indices, in 32-bit units.
const CS: usize = 0;
const FIFO: usize = 1;
const CLK: usize = 2;

// CS register bits.
const CS_TA: u32 = 1 << 7;
const CS_CLEAR_TX: u32 = 1 << 4;
const CS_CLEAR_RX: u32 = 1 << 5;
const CS_DONE: u32 = 1 << 16;
const CS_RXD: u32 = 1 << 17;
const CS_TXD: u32 = 1 << 18;

// Core clock is 250 MHz; divide to a conservative 1 MHz default.
const DEFAULT_CLOCK_DIVIDER: u32 = 250;

pub struct SpiBlock {
    regs: MmioBlock,
}

impl SpiBlock {
    pub fn new(regs: MmioBlock) -> Self {
        regs.write(CLK, DEFAULT_CLOCK_DIVIDER);
        Self { regs }
    }

    pub fn transfer(
        &self,
        channel: u8,
        tx: &[u8],
        rx: &mut [u8],
    ) -> Result<(), GpioError> {
        // Select the chip-select line, clear both FIFOs, start the
        // transfer.
        self.regs.write(
            CS,
            u32::from(channel) | CS_CLEAR_TX | CS_CLEAR_RX | CS_TA,
        );

        let mut sent = 0;
        let mut received = 0;
        let mut spins: u32 = 0;
        while received < rx.len() {
            let status = self.regs.read(CS);
            let mut progressed = false;
            if sent < tx.len() && status & CS_TXD != 0 {
                self.regs.write(FIFO, u32::from(tx[sent]));
                sent += 1;
                progressed = true;
            }
            if status & CS_RXD != 0 {
                rx[received] = self.regs.read(FIFO) as u8;
                received += 1;
                progressed = true;
            }
            if progressed {
                spins = 0;
            } else {
                spins += 1;
                // A transfer this size completes in well under a second at
                // the default clock; a stalled FIFO means the controller
                // wedged.
                if spins > 10_000_000 {
                    self.regs.write(CS, CS_CLEAR_TX | CS_CLEAR_RX);
                    return Err(GpioError::HardwareFault);
                }
            }
        }

        while self.regs.read(CS) & CS_DONE == 0 {
            core::hint::spin_loop();
        }
        // Deassert TA, leaving the FIFOs clean for the next caller.
        self.regs.write(CS, CS_CLEAR_TX | CS_CLEAR_RX);
        Ok(())
    }
}
