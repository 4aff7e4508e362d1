//! 이상치 필터 -- 센서별 슬라이딩 윈도우 기반 중앙값 ± 3·MAD 판정
//!
//! [`OutlierFilter`]는 최근 W개의 값을 FIFO 윈도우로 유지합니다.
//! 윈도우가 가득 찬 상태에서 새 값이 `median ± 3·MAD` 범위를 벗어나면 이상치로 판정하고,
//! 설정에 따라 평균값으로 대체하거나(대체 모드) 플래그만 설정합니다(플래그 모드).
//!
//! # 윈도우 갱신 규칙
//! - 이상치로 판정된 값은 윈도우에 넣지 않고, 판정 직전 윈도우의 평균을 대신 넣습니다.
//! - 용량 미만이면 뒤에 추가하고, 용량에 도달하면 가장 오래된 값을 버린 뒤 추가합니다.
//! - 용량 미만일 때는 판정하지 않습니다.
//!
//! 통계([`WindowStats`])는 필요할 때 계산하여 캐시하고, 윈도우가 바뀔 때마다 무효화합니다.

use std::collections::{HashMap, VecDeque};

/// MAD 배수
const MAD_MULTIPLIER: f64 = 3.0;

/// 윈도우 초기 할당 상한. 더 큰 윈도우는 값이 들어오는 만큼 늘어납니다.
const PREALLOCATED_WINDOW: usize = 64;

/// 이상치 필터 설정
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutlierSettings {
    /// 윈도우 크기 W (1 이상)
    pub window_size: usize,
    /// 이상치를 평균값으로 대체할지 여부 (false면 플래그만 설정)
    pub replace_on_detect: bool,
}

impl Default for OutlierSettings {
    fn default() -> Self {
        Self {
            window_size: 15,
            replace_on_detect: false,
        }
    }
}

/// 윈도우 통계
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    /// 중앙값
    pub median: f64,
    /// 중앙값 절대 편차 (median absolute deviation)
    pub mad: f64,
    /// 하한 (`median - 3·MAD`)
    pub lower: f64,
    /// 상한 (`median + 3·MAD`)
    pub upper: f64,
    /// 평균
    pub mean: f64,
}

impl WindowStats {
    /// 값 목록에서 통계를 계산합니다. 빈 목록이면 `None`.
    pub fn compute(values: impl Iterator<Item = f64>) -> Option<Self> {
        let mut sorted: Vec<f64> = values.collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_by(f64::total_cmp);

        let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;
        let median = median_of_sorted(&sorted);

        let mut deviations: Vec<f64> = sorted.iter().map(|v| (v - median).abs()).collect();
        deviations.sort_by(f64::total_cmp);
        let mad = median_of_sorted(&deviations);

        Some(Self {
            median,
            mad,
            lower: median - MAD_MULTIPLIER * mad,
            upper: median + MAD_MULTIPLIER * mad,
            mean,
        })
    }

    /// 값이 범위를 벗어나는지 확인합니다.
    pub fn is_outlier(&self, value: f64) -> bool {
        value > self.upper || value < self.lower
    }
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// 판정 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// 윈도우가 아직 가득 차지 않아 판정하지 않음
    Warmup,
    /// 정상 범위
    Normal,
    /// 이상치
    Outlier,
}

/// 필터 처리 결과
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterOutcome {
    /// 내보낼 값 (대체 모드에서 이상치면 평균값)
    pub value: f64,
    /// 이상치 플래그 (플래그 모드에서 이상치일 때만 `Some(true)`)
    pub outlier: Option<bool>,
    /// 대체 표시 (대체 모드에서 이상치일 때만 `true`, `value`는 윈도우 평균)
    pub substituted: bool,
    /// 판정 결과
    pub classification: Classification,
}

/// 센서 하나의 이상치 필터
#[derive(Debug, Clone)]
pub struct OutlierFilter {
    settings: OutlierSettings,
    window: VecDeque<f64>,
    cached: Option<WindowStats>,
}

impl OutlierFilter {
    /// 새 필터를 생성합니다. 윈도우 크기 0은 1로 취급합니다.
    pub fn new(settings: OutlierSettings) -> Self {
        let settings = OutlierSettings {
            window_size: settings.window_size.max(1),
            ..settings
        };
        Self {
            settings,
            window: VecDeque::with_capacity(settings.window_size.min(PREALLOCATED_WINDOW)),
            cached: None,
        }
    }

    /// 값을 판정하고 윈도우를 갱신합니다.
    pub fn process(&mut self, value: f64) -> FilterOutcome {
        if !self.is_full() {
            self.push(value);
            return FilterOutcome {
                value,
                outlier: None,
                substituted: false,
                classification: Classification::Warmup,
            };
        }

        let Some(stats) = self.stats() else {
            self.push(value);
            return FilterOutcome {
                value,
                outlier: None,
                substituted: false,
                classification: Classification::Warmup,
            };
        };

        if !stats.is_outlier(value) {
            self.push(value);
            return FilterOutcome {
                value,
                outlier: None,
                substituted: false,
                classification: Classification::Normal,
            };
        }

        self.push(stats.mean);
        if self.settings.replace_on_detect {
            FilterOutcome {
                value: stats.mean,
                outlier: None,
                substituted: true,
                classification: Classification::Outlier,
            }
        } else {
            FilterOutcome {
                value,
                outlier: Some(true),
                substituted: false,
                classification: Classification::Outlier,
            }
        }
    }

    /// 현재 윈도우의 통계를 반환합니다 (캐시 사용).
    pub fn stats(&mut self) -> Option<WindowStats> {
        if self.cached.is_none() {
            self.cached = WindowStats::compute(self.window.iter().copied());
        }
        self.cached
    }

    /// 윈도우가 가득 찼는지 확인합니다.
    pub fn is_full(&self) -> bool {
        self.window.len() >= self.settings.window_size
    }

    /// 윈도우에 들어 있는 값의 수를 반환합니다.
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// 윈도우가 비어있는지 확인합니다.
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// 윈도우 값을 오래된 순서로 반환합니다.
    pub fn window(&self) -> impl Iterator<Item = f64> + '_ {
        self.window.iter().copied()
    }

    /// 필터 설정을 반환합니다.
    pub fn settings(&self) -> OutlierSettings {
        self.settings
    }

    fn push(&mut self, value: f64) {
        if self.window.len() >= self.settings.window_size {
            self.window.pop_front();
        }
        self.window.push_back(value);
        self.cached = None;
    }
}

/// 세션 하나의 센서별 필터 묶음
#[derive(Debug, Clone)]
pub struct FilterBank {
    settings: OutlierSettings,
    filters: HashMap<String, OutlierFilter>,
}

impl FilterBank {
    /// 새 필터 묶음을 생성합니다.
    pub fn new(settings: OutlierSettings) -> Self {
        Self {
            settings,
            filters: HashMap::new(),
        }
    }

    /// 센서의 필터로 값을 처리합니다. 처음 보는 센서면 필터를 새로 만듭니다.
    pub fn process(&mut self, sensor_id: &str, value: f64) -> FilterOutcome {
        let settings = self.settings;
        self.filters
            .entry(sensor_id.to_owned())
            .or_insert_with(|| OutlierFilter::new(settings))
            .process(value)
    }

    /// 센서의 필터를 조회합니다.
    pub fn get(&self, sensor_id: &str) -> Option<&OutlierFilter> {
        self.filters.get(sensor_id)
    }

    /// 추적 중인 센서 수를 반환합니다.
    pub fn sensor_count(&self) -> usize {
        self.filters.len()
    }

    /// 모든 필터 상태를 버립니다.
    pub fn clear(&mut self) {
        self.filters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn filter(window_size: usize, replace_on_detect: bool) -> OutlierFilter {
        OutlierFilter::new(OutlierSettings {
            window_size,
            replace_on_detect,
        })
    }

    #[test]
    fn replace_mode_substitutes_mean() {
        let mut f = filter(5, true);
        for _ in 0..5 {
            f.process(10.0);
        }
        let outcome = f.process(1000.0);
        assert_eq!(outcome.value, 10.0);
        assert_eq!(outcome.outlier, None);
        assert!(outcome.substituted);
        assert_eq!(outcome.classification, Classification::Outlier);
        assert_eq!(f.window().collect::<Vec<_>>(), vec![10.0; 5]);
    }

    #[test]
    fn huge_window_does_not_preallocate() {
        let mut f = filter(9_000_000_000_000_000_000, false);
        let outcome = f.process(1.0);
        assert_eq!(outcome.classification, Classification::Warmup);
        assert_eq!(f.len(), 1);
    }

    #[test]
    fn flag_mode_keeps_value_and_inserts_mean() {
        let mut f = filter(5, false);
        for _ in 0..5 {
            f.process(10.0);
        }
        let outcome = f.process(1000.0);
        assert_eq!(outcome.value, 1000.0);
        assert_eq!(outcome.outlier, Some(true));
        assert_eq!(f.window().collect::<Vec<_>>(), vec![10.0; 5]);
    }

    #[test]
    fn below_capacity_is_never_classified() {
        let mut f = filter(5, false);
        for v in [1.0, 1000.0, -1000.0, 5.0] {
            let outcome = f.process(v);
            assert_eq!(outcome.classification, Classification::Warmup);
            assert_eq!(outcome.outlier, None);
            assert_eq!(outcome.value, v);
        }
        assert_eq!(f.len(), 4);
    }

    #[test]
    fn normal_value_slides_window() {
        let mut f = filter(3, false);
        for v in [1.0, 2.0, 3.0] {
            f.process(v);
        }
        let outcome = f.process(2.5);
        assert_eq!(outcome.classification, Classification::Normal);
        assert_eq!(f.window().collect::<Vec<_>>(), vec![2.0, 3.0, 2.5]);
    }

    #[test]
    fn repeated_outliers_keep_inserting_mean() {
        let mut f = filter(4, false);
        for v in [10.0, 12.0, 10.0, 12.0] {
            f.process(v);
        }
        let first = f.process(500.0);
        assert_eq!(first.outlier, Some(true));
        let second = f.process(500.0);
        assert_eq!(second.outlier, Some(true));
        assert!(f.window().all(|v| v < 100.0));
    }

    #[test]
    fn window_of_one() {
        let mut f = filter(1, false);
        assert_eq!(f.process(5.0).classification, Classification::Warmup);
        // MAD=0: 같은 값은 정상, 다른 값은 이상치
        assert_eq!(f.process(5.0).classification, Classification::Normal);
        assert_eq!(f.process(6.0).classification, Classification::Outlier);
        assert_eq!(f.window().collect::<Vec<_>>(), vec![5.0]);
    }

    #[test]
    fn zero_window_is_treated_as_one() {
        let f = filter(0, false);
        assert_eq!(f.settings().window_size, 1);
    }

    #[test]
    fn stats_median_mad_bounds() {
        let stats = WindowStats::compute([1.0, 2.0, 3.0, 4.0, 100.0].into_iter()).unwrap();
        assert_eq!(stats.median, 3.0);
        // |x-3| = [2,1,0,1,97] -> sorted [0,1,1,2,97] -> MAD 1
        assert_eq!(stats.mad, 1.0);
        assert_eq!(stats.lower, 0.0);
        assert_eq!(stats.upper, 6.0);
        assert_eq!(stats.mean, 22.0);
        assert!(stats.is_outlier(6.5));
        assert!(!stats.is_outlier(6.0));
    }

    #[test]
    fn stats_even_length_median() {
        let stats = WindowStats::compute([4.0, 1.0, 3.0, 2.0].into_iter()).unwrap();
        assert_eq!(stats.median, 2.5);
        assert!(WindowStats::compute(std::iter::empty()).is_none());
    }

    #[test]
    fn stats_cache_is_invalidated_on_push() {
        let mut f = filter(3, false);
        for v in [1.0, 1.0, 1.0] {
            f.process(v);
        }
        assert_eq!(f.stats().unwrap().mean, 1.0);
        f.process(1.0);
        assert_eq!(f.stats().unwrap().mean, 1.0);

        let mut g = filter(2, false);
        g.process(2.0);
        g.process(4.0);
        assert_eq!(g.stats().unwrap().mean, 3.0);
        // 2.0, 4.0: median 3, MAD 1 -> [0, 6] 범위
        g.process(5.0);
        assert_eq!(g.stats().unwrap().mean, 4.5);
    }

    #[test]
    fn filter_bank_keeps_sensors_independent() {
        let mut bank = FilterBank::new(OutlierSettings {
            window_size: 3,
            replace_on_detect: false,
        });
        for _ in 0..3 {
            bank.process("temp", 20.0);
        }
        bank.process("hum", 1000.0);

        assert_eq!(bank.sensor_count(), 2);
        assert_eq!(bank.get("temp").unwrap().len(), 3);
        assert_eq!(bank.get("hum").unwrap().len(), 1);
        assert_eq!(
            bank.process("hum", 1.0).classification,
            Classification::Warmup
        );
        assert_eq!(bank.process("temp", 99.0).outlier, Some(true));

        bank.clear();
        assert_eq!(bank.sensor_count(), 0);
    }

    proptest! {
        #[test]
        fn window_never_exceeds_capacity(
            w in 1usize..20,
            values in prop::collection::vec(-1e6f64..1e6, 0..200),
            replace in any::<bool>(),
        ) {
            let mut f = filter(w, replace);
            for v in values {
                f.process(v);
                prop_assert!(f.len() <= w);
            }
        }

        #[test]
        fn warmup_never_flags(
            w in 2usize..30,
            values in prop::collection::vec(-1e6f64..1e6, 1..30),
        ) {
            let mut f = filter(w, false);
            for (i, v) in values.into_iter().enumerate() {
                let outcome = f.process(v);
                if i < w {
                    prop_assert_eq!(outcome.classification, Classification::Warmup);
                    prop_assert_eq!(outcome.outlier, None);
                }
            }
        }

        #[test]
        fn replace_mode_never_flags(values in prop::collection::vec(-1e3f64..1e3, 0..100)) {
            let mut f = filter(5, true);
            for v in values {
                prop_assert_eq!(f.process(v).outlier, None);
            }
        }
    }
}
