use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};
use num_derive::FromPrimitive;

use crate::sdk::common::bit::{get_field, set_field};
use crate::{BIT, BIT_RNG};

// RF_OVERRULE_REG values on DA14531
pub const OVERRULE_RELEASE: u32 = 0;
pub const OVERRULE_TX_ON: u32 = 3;
pub const OVERRULE_TX_RX_OFF: u32 = 5;

// RF_OVERRULE_REG write strobes on DA1458x
pub const TX_EN_WR: u32 = BIT!(0);
pub const TX_DIS_WR: u32 = BIT!(1);
pub const RX_EN_WR: u32 = BIT!(2);
pub const RX_DIS_WR: u32 = BIT!(3);

// Base frequency programmed into ADPLL_CN_CTRL_REG, in MHz
pub const ADPLL_BASE_FREQ_MHZ: u32 = 2402;

// Peripheral window the ARP entries address
pub const ARP_REG_BASE: u32 = 0x4000_0000;

pub const ARPT_PWR_ENTRIES: usize = 1;
pub const ARPT_PREF_ENTRIES: usize = 9;
pub const ARPT_TX_ENTRIES: usize = 7;
pub const ARPT_RX_ENTRIES: usize = 8;

/// PA output level, as accepted by the SET_TX_POWER command.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxPowerLevel {
    Minus18d0 = 1,
    Minus12d0 = 2,
    Minus8d6 = 3,
    Minus6d2 = 4,
    Minus4d3 = 5,
    Minus2d8 = 6,
    Minus1d5 = 7,
    Minus0d3 = 8,
    Plus0d6 = 9,
    Plus1d5 = 10,
    Plus2d3 = 11,
    Plus3d1 = 12,
}

impl TxPowerLevel {
    /// Nominal output power in tenths of a dBm.
    pub const fn deci_dbm(&self) -> i16 {
        match self {
            TxPowerLevel::Minus18d0 => -180,
            TxPowerLevel::Minus12d0 => -120,
            TxPowerLevel::Minus8d6 => -86,
            TxPowerLevel::Minus6d2 => -62,
            TxPowerLevel::Minus4d3 => -43,
            TxPowerLevel::Minus2d8 => -28,
            TxPowerLevel::Minus1d5 => -15,
            TxPowerLevel::Minus0d3 => -3,
            TxPowerLevel::Plus0d6 => 6,
            TxPowerLevel::Plus1d5 => 15,
            TxPowerLevel::Plus2d3 => 23,
            TxPowerLevel::Plus3d1 => 31,
        }
    }
}

bitflags! {
    /// RF_LDO_CTRL_REG fields touched by the continuous mode configuration.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct LdoCtrl: u32 {
        const RADIO_HOLD_OVR_VAL = BIT!(0);
        const RADIO_HOLD_OVR_EN = BIT!(1);
        const DTC_HOLD_OVR_VAL = BIT!(2);
        const DTC_HOLD_OVR_EN = BIT!(3);
        const DCO_HOLD_OVR_VAL = BIT!(4);
        const DCO_HOLD_OVR_EN = BIT!(5);
        const RADIO_CONT_ENABLE = BIT!(8);
        const DTC_CONT_ENABLE = BIT!(9);
        const DCO_CONT_ENABLE = BIT!(10);

        const _ = !0;
    }
}

impl LdoCtrl {
    const CONT_ENABLE: Self = Self::RADIO_CONT_ENABLE
        .union(Self::DTC_CONT_ENABLE)
        .union(Self::DCO_CONT_ENABLE);
    const HOLD_OVR_VAL: Self = Self::RADIO_HOLD_OVR_VAL
        .union(Self::DTC_HOLD_OVR_VAL)
        .union(Self::DCO_HOLD_OVR_VAL);
    const HOLD_OVR_EN: Self = Self::RADIO_HOLD_OVR_EN
        .union(Self::DTC_HOLD_OVR_EN)
        .union(Self::DCO_HOLD_OVR_EN);
}

/// Computes the new RF_LDO_CTRL_REG value from the current one.
///
/// # Parameters
///
/// * `current` - Value read back from RF_LDO_CTRL_REG
/// * `cont_mode` - Whether radio continuous mode is active
///
/// # Algorithm
///
/// 1. In continuous mode, set the three CONT_ENABLE bits, clear the three hold override
///    values and set the three hold override enables, so the LDOs stay powered
/// 2. Otherwise clear the CONT_ENABLE and hold override enable bits
///
/// # Notes
///
/// * Bits outside the LDO fields are preserved
pub fn ldo_ctrl_value(current: u32, cont_mode: bool) -> u32 {
    let mut val = LdoCtrl::from_bits_retain(current);
    if cont_mode {
        val.insert(LdoCtrl::CONT_ENABLE);
        val.remove(LdoCtrl::HOLD_OVR_VAL);
        val.insert(LdoCtrl::HOLD_OVR_EN);
    } else {
        val.remove(LdoCtrl::CONT_ENABLE);
        val.remove(LdoCtrl::HOLD_OVR_EN);
    }
    val.bits()
}

bitflags! {
    /// BLE_RFTESTCNTL_REG fields.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct RfTestCntl: u32 {
        const TXLENGTH = BIT_RNG!(0, 8);
        const TXPKTCNTEN = BIT!(11);
        const TXLENGTHSRC = BIT!(13);
        const TXPLDSRC = BIT!(14);
        const INFINITETX = BIT!(15);
        const RXPKTCNTEN = BIT!(27);
        const INFINITERX = BIT!(31);
    }
}

impl RfTestCntl {
    /// Bits cleared after the LE TX start so the packet source becomes endless.
    pub const CONTINUOUS_TX_CLEAR: Self = Self::TXLENGTHSRC
        .union(Self::TXPLDSRC)
        .union(Self::TXLENGTH);
}

bitflags! {
    /// RF_RADIO_INIT_REG fields.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct RadioInit: u16 {
        const ADPLLDIG_PWR_SW1_EN = BIT!(0);
        const RADIO_LDO_EN = BIT!(1);
        const ADPLLDIG_HRESET_N = BIT!(8);
        const ADPLLDIG_HCLK_EN = BIT!(9);
    }
}

bitflags! {
    /// ADPLL_CN_CTRL_REG fields.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct AdpllCnCtrl: u32 {
        const CN = BIT_RNG!(0, 5);
        const CS = BIT!(6);
        const CH0 = BIT_RNG!(16, 27);
    }
}

/// Builds the ADPLL_CN_CTRL_REG word that pins the synthesiser to channel `cn`.
pub fn adpll_cn_word(cn: u8) -> u32 {
    (ADPLL_BASE_FREQ_MHZ << 16) | AdpllCnCtrl::CS.bits() | (cn as u32 & AdpllCnCtrl::CN.bits())
}

/// One Automatic Radio Programming entry.
///
/// Layout: data\[15:0\], addr\[29:16\], 8-bit write flag at 30, valid flag at 31.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct ArpEntry(pub u32);

impl ArpEntry {
    const DATA: u32 = BIT_RNG!(0, 15);
    const ADDR: u32 = BIT_RNG!(16, 29);
    const DATA8: u32 = BIT!(30);
    const VALID: u32 = BIT!(31);

    pub const fn new(addr: u16, data: u16, data8: bool) -> Self {
        let mut v = set_field(Self::VALID, Self::ADDR, addr as u32);
        v = set_field(v, Self::DATA, data as u32);
        if data8 {
            v |= Self::DATA8;
        }
        Self(v)
    }

    pub const fn data(&self) -> u16 {
        get_field(self.0, Self::DATA) as u16
    }

    /// Absolute register address written by this entry.
    pub const fn reg_address(&self) -> u32 {
        ARP_REG_BASE + get_field(self.0, Self::ADDR)
    }

    pub const fn is_8bit(&self) -> bool {
        self.0 & Self::DATA8 != 0
    }

    pub const fn is_valid(&self) -> bool {
        self.0 & Self::VALID != 0
    }
}

/// Snapshot of the ARP table kept by the radio driver in retention RAM.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct ArpTable {
    pub pwr: [ArpEntry; ARPT_PWR_ENTRIES],
    pub null1: u32,
    pub tx_tbase: u16,
    pub rx_tbase: u16,
    pub pref: [ArpEntry; ARPT_PREF_ENTRIES],
    pub null2: u32,
    pub tx_en_delay: ArpEntry,
    pub tx: [ArpEntry; ARPT_TX_ENTRIES],
    pub null3: u32,
    pub rx_en_delay: ArpEntry,
    pub rx: [ArpEntry; ARPT_RX_ENTRIES],
    pub null4: u32,
}

impl ArpTable {
    /// Entries applied to bring the radio into TX outside the link layer.
    ///
    /// The power entry is taken when valid, then the preferred settings and the TX
    /// settings, each list up to its first invalid entry.
    pub fn tx_configuration(&self) -> impl Iterator<Item = &ArpEntry> {
        self.pwr[..1]
            .iter()
            .filter(|e| e.is_valid())
            .chain(self.pref.iter().take_while(|e| e.is_valid()))
            .chain(self.tx.iter().take_while(|e| e.is_valid()))
    }
}
