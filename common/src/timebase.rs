// 统一低延迟视频流传输系统 - 时间基实现
//
// 本模块定义了有理数时间基以及时间戳在不同时间基之间的换算。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 有理数时间基（一个刻度 = num/den 秒）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    /// MPEG 系统时钟（90kHz）
    pub const MPEG_CLOCK: Rational = Rational::new(1, 90_000);
    /// 微秒
    pub const MICROS: Rational = Rational::new(1, 1_000_000);

    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    /// 以采样率构造时间基（1/sample_rate）
    pub fn per_second(rate: u32) -> Self {
        Self::new(1, rate.min(i32::MAX as u32) as i32)
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        self.num as f64 / self.den as f64
    }

    /// 倒数（帧率 <-> 帧间隔）
    pub fn invert(&self) -> Self {
        Self::new(self.den, self.num)
    }
}

impl fmt::Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// 将时间戳从一个时间基换算到另一个时间基
///
/// 计算 `value * from / to`，结果四舍五入（远离零方向），中间结果使用 i128
/// 避免溢出。
///
/// # 参数
///
/// - `value`: 以 `from` 为单位的时间戳
/// - `from`: 源时间基
/// - `to`: 目标时间基
///
/// # 示例
///
/// ```
/// use common::{rescale, Rational};
/// assert_eq!(rescale(1, Rational::new(1, 1000), Rational::MPEG_CLOCK), 90);
/// ```
pub fn rescale(value: i64, from: Rational, to: Rational) -> i64 {
    let mut num = value as i128 * from.num as i128 * to.den as i128;
    let mut den = from.den as i128 * to.num as i128;
    if den == 0 {
        return 0;
    }
    if den < 0 {
        num = -num;
        den = -den;
    }

    let half = den / 2;
    let result = if num >= 0 {
        (num + half) / den
    } else {
        (num - half) / den
    };

    result.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}
