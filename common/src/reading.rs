use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("sensor returned a value that is not a number")]
    NotANumber,
    #[error("sensor driver error: {0}")]
    Driver(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub temperature_c: f32,
    pub humidity: f32,
}

impl Reading {
    pub fn new(temperature_c: f32, humidity: f32) -> Result<Self, SensorError> {
        if !temperature_c.is_finite() || !humidity.is_finite() {
            return Err(SensorError::NotANumber);
        }

        Ok(Self {
            temperature_c,
            humidity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_channels() {
        assert_eq!(Reading::new(f32::NAN, 40.0), Err(SensorError::NotANumber));
        assert_eq!(Reading::new(21.0, f32::NAN), Err(SensorError::NotANumber));
        assert_eq!(
            Reading::new(f32::INFINITY, 40.0),
            Err(SensorError::NotANumber)
        );
    }

    #[test]
    fn accepts_finite_pair() {
        let reading = Reading::new(-4.5, 99.9).unwrap();
        assert_eq!(reading.temperature_c, -4.5);
        assert_eq!(reading.humidity, 99.9);
    }
}
