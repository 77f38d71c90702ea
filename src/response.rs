use bitfield::bitfield;

bitfield! {
    /// R1 response bitset.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct R1Response(u8);
    pub in_idle_state, _: 0;
    pub erase_reset, _: 1;
    pub illegal_command, _: 2;
    pub command_crc_error, _: 3;
    pub erase_sequence_error, _: 4;
    pub address_error, _: 5;
    pub parameter_error, _: 6;
}

impl R1Response {
    /// Card is out of idle state with no error bits set.
    pub const READY_STATE: R1Response = R1Response(0x00);
    /// Card is in the idle state after reset.
    pub const IN_IDLE_STATE: R1Response = R1Response(0x01);

    /// A real response has the high bit clear; idle `0xFF` polls don't.
    pub fn is_valid(&self) -> bool {
        self.0 & 0x80 == 0
    }
}
