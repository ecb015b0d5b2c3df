use static_assertions::const_assert_eq;
use tock_registers::{
    register_structs,
    registers::{ReadWrite, WriteOnly},
};

// One interrupt file as seen by devices and by the owning hart. SETEIPNUM /
// CLREIPNUM are id doorbells; EIP / EIE are bitmaps, 32 ids per word.
register_structs! {
    pub ImsicFileRegs {
        (0x000 => pub seteipnum: WriteOnly<u32>),
        (0x004 => pub clreipnum: WriteOnly<u32>),
        (0x008 => _reserved0),
        (0x040 => pub seteidelivery: WriteOnly<u32>),
        (0x044 => pub clreidelivery: WriteOnly<u32>),
        (0x048 => _reserved1),
        (0x070 => pub eithreshold: ReadWrite<u32>),
        (0x074 => _reserved2),
        (0x080 => pub eip: [ReadWrite<u32>; 16]),
        (0x0C0 => pub eie: [ReadWrite<u32>; 16]),
        (0x100 => @END),
    }
}

const_assert_eq!(core::mem::size_of::<ImsicFileRegs>(), 0x100);
