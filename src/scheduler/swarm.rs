use serde::Deserialize;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SwarmConfigError {
    #[error("min_instances_per_host ({min}) exceeds max_instances_per_host ({max})")]
    LocalMinAboveLocalMax { min: u32, max: u32 },
    #[error("max_instances_per_host ({local}) exceeds max_instances_global ({global})")]
    LocalMaxAboveGlobalMax { local: u32, global: u32 },
    #[error("min_instances_per_host ({local}) exceeds max_instances_global ({global})")]
    LocalMinAboveGlobalMax { local: u32, global: u32 },
    #[error("min_instances_global ({min}) exceeds max_instances_global ({max})")]
    GlobalMinAboveGlobalMax { min: u32, max: u32 },
}

/// Capacity policy bounding instances per host and across the cluster.
///
/// Unset minimums are 0, unset maximums unbounded.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SwarmSchedule {
    #[serde(default)]
    pub min_instances_per_host: Option<u32>,
    #[serde(default)]
    pub max_instances_per_host: Option<u32>,
    #[serde(default)]
    pub min_instances_global: Option<u32>,
    #[serde(default)]
    pub max_instances_global: Option<u32>,
}

impl SwarmSchedule {
    fn local_min(&self) -> u32 {
        self.min_instances_per_host.unwrap_or(0)
    }

    fn local_max(&self) -> u32 {
        self.max_instances_per_host.unwrap_or(u32::MAX)
    }

    fn global_min(&self) -> u32 {
        self.min_instances_global.unwrap_or(0)
    }

    fn global_max(&self) -> u32 {
        self.max_instances_global.unwrap_or(u32::MAX)
    }

    pub fn validate(&self) -> Result<(), SwarmConfigError> {
        let (local_min, local_max) = (self.local_min(), self.local_max());
        let (global_min, global_max) = (self.global_min(), self.global_max());
        if local_min > local_max {
            return Err(SwarmConfigError::LocalMinAboveLocalMax {
                min: local_min,
                max: local_max,
            });
        }
        if local_max > global_max {
            return Err(SwarmConfigError::LocalMaxAboveGlobalMax {
                local: local_max,
                global: global_max,
            });
        }
        if local_min > global_max {
            return Err(SwarmConfigError::LocalMinAboveGlobalMax {
                local: local_min,
                global: global_max,
            });
        }
        if global_min > global_max {
            return Err(SwarmConfigError::GlobalMinAboveGlobalMax {
                min: global_min,
                max: global_max,
            });
        }
        Ok(())
    }

    /// Containers to start on this host given the instances already running
    /// here and across the cluster. Never more than one per call.
    pub fn schedule(&self, local: u32, global: u32) -> Result<u32, SwarmConfigError> {
        self.validate()?;
        if global >= self.global_max() {
            return Ok(0);
        }
        if local < self.local_max() {
            return Ok(1);
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    fn swarm(local_max: u32, global_max: u32) -> SwarmSchedule {
        SwarmSchedule {
            max_instances_per_host: Some(local_max),
            max_instances_global: Some(global_max),
            ..Default::default()
        }
    }

    #[test]
    fn test_global_max_reached() {
        assert_eq!(swarm(1, 1).schedule(0, 1), Ok(0));
        assert_eq!(swarm(1, 1).schedule(0, 3), Ok(0));
    }

    #[test]
    fn test_one_start_per_pass() {
        assert_eq!(swarm(1, 1).schedule(0, 0), Ok(1));
        assert_eq!(swarm(5, 10).schedule(0, 0), Ok(1));
        assert_eq!(swarm(5, 10).schedule(5, 5), Ok(0));
    }

    #[test]
    fn test_unbounded_schedule() {
        assert_eq!(SwarmSchedule::default().schedule(100, 1000), Ok(1));
    }

    #[test]
    fn test_invalid_bounds() {
        let schedule = SwarmSchedule {
            min_instances_per_host: Some(3),
            max_instances_per_host: Some(2),
            ..Default::default()
        };
        assert_eq!(
            schedule.schedule(0, 0),
            Err(SwarmConfigError::LocalMinAboveLocalMax { min: 3, max: 2 })
        );
        assert_eq!(
            swarm(4, 2).validate(),
            Err(SwarmConfigError::LocalMaxAboveGlobalMax {
                local: 4,
                global: 2
            })
        );
    }

    #[test]
    fn test_from_toml() {
        let schedule: SwarmSchedule = toml::from_str(
            r#"
            max_instances_per_host = 1
            max_instances_global = 3
        "#,
        )
        .unwrap();
        assert_eq!(schedule, swarm(1, 3));
        assert!(toml::from_str::<SwarmSchedule>("max_per_host = 1").is_err());
    }

    #[quickcheck]
    fn never_more_than_one(local: u32, global: u32, local_max: u8, extra: u8) -> bool {
        let schedule = swarm(local_max as u32, local_max as u32 + extra as u32);
        schedule.schedule(local, global).is_ok_and(|n| n <= 1)
    }
}
