use embassy_time::Duration;

// Timer0/Timer2 input clock before the shared divider
pub const TIM0_2_SOURCE_CLK_HZ: u32 = 16_000_000;
pub const TIM0_32K_CLK_HZ: u32 = 32_000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Tim02ClkDiv {
    Div1 = 1,
    Div2 = 2,
    Div4 = 4,
    Div8 = 8,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Tim0ClkSource {
    /// Divided 16 MHz system clock.
    Fast,
    /// 32 kHz low power clock.
    Clk32k,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Tim0PwmMode {
    One,
    Clock,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Tim0ClkDiv {
    NoDiv,
    DivBy10,
}

/// Mode word passed to `timer0_init`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timer0Config {
    pub source: Tim0ClkSource,
    pub pwm_mode: Tim0PwmMode,
    pub div: Tim0ClkDiv,
}

/// Timer0 'on', 'high' and 'low' reload values.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timer0Reload {
    pub on: u16,
    pub high: u16,
    pub low: u16,
}

impl Timer0Reload {
    pub const fn new(on: u16, high: u16, low: u16) -> Self {
        Self { on, high, low }
    }
}

/// Shared divider used by every Timer0 user here, 16 MHz / 8 = 2 MHz.
pub const TIM0_2_CLK_DIV: Tim02ClkDiv = Tim02ClkDiv::Div8;

pub const REFRESH_TIMER_CONFIG: Timer0Config = Timer0Config {
    source: Tim0ClkSource::Fast,
    pwm_mode: Tim0PwmMode::One,
    div: Tim0ClkDiv::NoDiv,
};
// 20000 ticks of 2 MHz, one interrupt every 10 ms
pub const REFRESH_TIMER_RELOAD: Timer0Reload = Timer0Reload::new(20000, 5000, 2000);

// Division by 10 has no effect on the 32 kHz source
pub const WD_TIMER_CONFIG: Timer0Config = Timer0Config {
    source: Tim0ClkSource::Clk32k,
    pwm_mode: Tim0PwmMode::One,
    div: Tim0ClkDiv::DivBy10,
};
// 2 s low, 30 ms high, about 0.49 Hz
pub const WD_TIMER_RELOAD: Timer0Reload = Timer0Reload::new(1000, 1000, 65535);

// Timer2 PWM runs from the divided 2 MHz clock
pub const TIM2_PWM_CLK_HZ: u32 = TIM0_2_SOURCE_CLK_HZ / TIM0_2_CLK_DIV as u32;

/// Timer2 PWM2 output request derived from GPIO_SET.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Timer2Pwm {
    pub freq_hz: u32,
    pub input_clk_hz: u32,
    /// Duty cycle in percent.
    pub duty: u8,
}

impl Timer2Pwm {
    /// `pwm_khz` is the frequency in kHz as sent by the host.
    pub const fn from_khz(pwm_khz: u8, duty: u8) -> Self {
        Self {
            freq_hz: pwm_khz as u32 * 1000,
            input_clk_hz: TIM2_PWM_CLK_HZ,
            duty,
        }
    }
}

/// Computes the interrupt period of Timer0 in PWM mode one.
///
/// # Parameters
///
/// * `config` - Clock source and divider as given to `timer0_init`
/// * `clk_div` - Shared Timer0/Timer2 input divider
/// * `reload` - Reload values, the 'on' counter defines the period
///
/// # Notes
///
/// * The shared divider only applies to the fast clock
pub fn timer0_period(config: &Timer0Config, clk_div: Tim02ClkDiv, reload: &Timer0Reload) -> Duration {
    let clk_hz = match config.source {
        Tim0ClkSource::Fast => {
            let hz = TIM0_2_SOURCE_CLK_HZ / clk_div as u32;
            match config.div {
                Tim0ClkDiv::NoDiv => hz,
                Tim0ClkDiv::DivBy10 => hz / 10,
            }
        }
        Tim0ClkSource::Clk32k => TIM0_32K_CLK_HZ,
    };
    Duration::from_micros(reload.on as u64 * 1_000_000 / clk_hz as u64)
}
