//! Service types and validated channel requirements.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{PlanError, PlanResult, ValidationError};

/// AI service types that can be sized by channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Callbot,
    Chatbot,
    Advisor,
    Stt,
    Tts,
    Ta,
    Qa,
}

impl ServiceType {
    pub const ALL: [ServiceType; 7] = [
        ServiceType::Callbot,
        ServiceType::Chatbot,
        ServiceType::Advisor,
        ServiceType::Stt,
        ServiceType::Tts,
        ServiceType::Ta,
        ServiceType::Qa,
    ];

    /// Wire name, also used as the DNS slug of the service.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Callbot => "callbot",
            ServiceType::Chatbot => "chatbot",
            ServiceType::Advisor => "advisor",
            ServiceType::Stt => "stt",
            ServiceType::Tts => "tts",
            ServiceType::Ta => "ta",
            ServiceType::Qa => "qa",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = PlanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        ServiceType::ALL
            .iter()
            .copied()
            .find(|svc| svc.as_str() == needle)
            .ok_or_else(|| PlanError::UnsupportedService {
                service: s.trim().to_string(),
            })
    }
}

/// Channel demand for one service type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceChannelRequirement {
    pub service_type: ServiceType,
    pub channel_count: u32,
}

/// A validated set of channel requirements, unique per service type.
///
/// Iteration order is the declaration order of [`ServiceType`], which keeps
/// every downstream computation deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelRequirements {
    counts: BTreeMap<ServiceType, u32>,
}

impl ChannelRequirements {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from untrusted `(service_type, channel_count)` pairs.
    ///
    /// Unknown service names fail with [`PlanError::UnsupportedService`];
    /// negative or duplicate entries fail with a [`ValidationError`].
    pub fn from_raw<I, S>(entries: I) -> PlanResult<Self>
    where
        I: IntoIterator<Item = (S, i64)>,
        S: AsRef<str>,
    {
        let mut counts = BTreeMap::new();
        for (name, count) in entries {
            let service: ServiceType = name.as_ref().parse()?;
            if count < 0 {
                return Err(ValidationError::NegativeChannelCount {
                    service: service.to_string(),
                    count,
                }
                .into());
            }
            let channels = u32::try_from(count).map_err(|_| {
                ValidationError::ChannelCountOverflow {
                    service: service.to_string(),
                    count,
                }
            })?;
            if counts.insert(service, channels).is_some() {
                return Err(ValidationError::DuplicateService {
                    service: service.to_string(),
                }
                .into());
            }
        }
        Ok(Self { counts })
    }

    /// Build from typed requirements, rejecting duplicate service types.
    pub fn from_requirements(requirements: &[ServiceChannelRequirement]) -> PlanResult<Self> {
        let mut counts = BTreeMap::new();
        for req in requirements {
            if counts.insert(req.service_type, req.channel_count).is_some() {
                return Err(ValidationError::DuplicateService {
                    service: req.service_type.to_string(),
                }
                .into());
            }
        }
        Ok(Self { counts })
    }

    /// Parse a `callbot=10,chatbot=20` style list.
    pub fn parse_list(list: &str) -> PlanResult<Self> {
        let mut entries = Vec::new();
        for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, count) = part
                .split_once('=')
                .ok_or_else(|| ValidationError::MalformedEntry(part.to_string()))?;
            let count: i64 = count
                .trim()
                .parse()
                .map_err(|_| ValidationError::MalformedEntry(part.to_string()))?;
            entries.push((name.trim().to_string(), count));
        }
        Self::from_raw(entries)
    }

    /// Builder-style setter; replaces any previous count for `service`.
    pub fn with(mut self, service: ServiceType, channels: u32) -> Self {
        self.counts.insert(service, channels);
        self
    }

    pub fn set(&mut self, service: ServiceType, channels: u32) {
        self.counts.insert(service, channels);
    }

    pub fn get(&self, service: ServiceType) -> Option<u32> {
        self.counts.get(&service).copied()
    }

    pub fn contains(&self, service: ServiceType) -> bool {
        self.counts.contains_key(&service)
    }

    pub fn iter(&self) -> impl Iterator<Item = ServiceChannelRequirement> + '_ {
        self.counts
            .iter()
            .map(|(service_type, channel_count)| ServiceChannelRequirement {
                service_type: *service_type,
                channel_count: *channel_count,
            })
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn total_channels(&self) -> u64 {
        self.counts.values().map(|c| u64::from(*c)).sum()
    }

    /// True when no service has a positive channel count.
    pub fn has_no_demand(&self) -> bool {
        self.total_channels() == 0
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Sizing presets offered by the hardware-sizing screens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    Small,
    Standard,
    Large,
}

impl Preset {
    pub const ALL: [Preset; 3] = [Preset::Small, Preset::Standard, Preset::Large];

    pub fn name(&self) -> &'static str {
        match self {
            Preset::Small => "small",
            Preset::Standard => "standard",
            Preset::Large => "large",
        }
    }

    pub fn requirements(&self) -> ChannelRequirements {
        let counts: [u32; 7] = match self {
            Preset::Small => [5, 10, 2, 5, 5, 5, 2],
            Preset::Standard => [10, 20, 5, 15, 10, 10, 5],
            Preset::Large => [50, 100, 20, 60, 50, 40, 20],
        };
        ServiceType::ALL
            .iter()
            .zip(counts)
            .fold(ChannelRequirements::new(), |reqs, (svc, count)| {
                reqs.with(*svc, count)
            })
    }
}

impl FromStr for Preset {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Preset::ALL
            .iter()
            .copied()
            .find(|p| p.name() == needle)
            .ok_or_else(|| ValidationError::MalformedEntry(format!("unknown preset '{}'", s)))
    }
}
