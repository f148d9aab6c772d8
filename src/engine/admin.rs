use tracing::info;
use ulid::Ulid;

use super::{Engine, EngineError};
use crate::limits::*;
use crate::model::*;
use crate::store::{ParkingLookup, ReservationLookup};

fn check_len(what: &str, value: &str, max: usize) -> Result<(), EngineError> {
    if value.is_empty() || value.len() > max {
        return Err(EngineError::InvalidInput(format!(
            "{what} must be 1..={max} bytes"
        )));
    }
    Ok(())
}

fn generate_secret() -> String {
    format!("{:016x}", Ulid::new().random() as u64)
}

impl Engine {
    pub async fn create_provider(&self, name: &str, kind: ProviderKind) -> Result<Provider, EngineError> {
        check_len("provider name", name, MAX_NAME_LEN)?;
        let provider = Provider {
            id: ObjectId::new(),
            name: name.to_string(),
            kind,
        };
        self.occupancy.insert(&provider).await?;
        info!(provider = %provider.id, "provider created");
        Ok(provider)
    }

    pub async fn create_space(
        &self,
        provider: ObjectId,
        location: Location,
        markings: &str,
        fee: Fee,
    ) -> Result<Space, EngineError> {
        if markings.len() > MAX_MARKINGS_LEN {
            return Err(EngineError::InvalidInput("markings too long".into()));
        }
        if !(-90.0..90.0).contains(&location.latitude) || !(-180.0..180.0).contains(&location.longitude) {
            return Err(EngineError::InvalidInput(format!(
                "coordinate out of range: {}, {}",
                location.latitude, location.longitude
            )));
        }
        if fee.unit_time <= 0 || !fee.charge.is_finite() || fee.charge < 0.0 {
            return Err(EngineError::InvalidInput(
                "fee needs a positive unit time and a non-negative charge".into(),
            ));
        }
        if self.occupancy.get::<Provider>(provider).await?.is_none() {
            return Err(EngineError::not_found("provider", provider));
        }
        let space = Space {
            id: ObjectId::new(),
            provider,
            location,
            markings: markings.to_string(),
            fee,
            deleted: false,
        };
        self.occupancy.insert(&space).await?;
        info!(space = %space.id, %provider, "space created");
        Ok(space)
    }

    /// Soft delete. Refused while a reservation or session is on the space.
    pub async fn delete_space(&self, id: ObjectId) -> Result<Space, EngineError> {
        let mut space = self.require_space(id).await?;
        if space.deleted {
            return Ok(space);
        }
        if self.occupancy.reservation(ReservationLookup::BySpace(id)).await?.is_some()
            || self.occupancy.parking(ParkingLookup::BySpace(id)).await?.is_some()
        {
            return Err(EngineError::Conflict(format!("space {id} is in use")));
        }
        space.deleted = true;
        if !self.occupancy.replace(&space).await? {
            return Err(EngineError::not_found("space", id));
        }
        info!(space = %id, "space deleted");
        Ok(space)
    }

    pub async fn space(&self, id: ObjectId) -> Result<Space, EngineError> {
        self.require_space(id).await
    }

    pub async fn register_user(
        &self,
        device_ids: Vec<String>,
        vehicle_ids: Vec<String>,
    ) -> Result<User, EngineError> {
        if device_ids.len() > MAX_DEVICES_PER_USER || vehicle_ids.len() > MAX_VEHICLES_PER_USER {
            return Err(EngineError::InvalidInput("too many devices or vehicles".into()));
        }
        for device in &device_ids {
            check_len("device id", device, MAX_DEVICE_ID_LEN)?;
        }
        for vehicle in &vehicle_ids {
            check_len("vehicle id", vehicle, MAX_VEHICLE_ID_LEN)?;
            if self.occupancy.user_by_vehicle(vehicle).await?.is_some() {
                return Err(EngineError::Conflict(format!(
                    "vehicle {vehicle} is registered to another user"
                )));
            }
        }
        let user = User {
            id: ObjectId::new(),
            device_ids,
            vehicle_ids,
        };
        self.occupancy.insert(&user).await?;
        info!(user = %user.id, "user registered");
        Ok(user)
    }

    pub async fn user(&self, id: ObjectId) -> Result<User, EngineError> {
        self.occupancy
            .user(id)
            .await?
            .ok_or_else(|| EngineError::not_found("user", id))
    }

    /// Attach a vehicle tag. A tag belongs to at most one user.
    pub async fn add_vehicle(&self, user: ObjectId, vehicle: &str) -> Result<User, EngineError> {
        check_len("vehicle id", vehicle, MAX_VEHICLE_ID_LEN)?;
        let mut user = self.user(user).await?;
        if let Some(owner) = self.occupancy.user_by_vehicle(vehicle).await? {
            if owner.id == user.id {
                return Ok(user);
            }
            return Err(EngineError::Conflict(format!(
                "vehicle {vehicle} is registered to another user"
            )));
        }
        if user.vehicle_ids.len() >= MAX_VEHICLES_PER_USER {
            return Err(EngineError::InvalidInput("too many vehicles".into()));
        }
        user.vehicle_ids.push(vehicle.to_string());
        if !self.occupancy.replace(&user).await? {
            return Err(EngineError::not_found("user", user.id));
        }
        Ok(user)
    }

    pub async fn add_device(&self, user: ObjectId, device: &str) -> Result<User, EngineError> {
        check_len("device id", device, MAX_DEVICE_ID_LEN)?;
        let mut user = self.user(user).await?;
        if user.device_ids.iter().any(|d| d == device) {
            return Ok(user);
        }
        if user.device_ids.len() >= MAX_DEVICES_PER_USER {
            return Err(EngineError::InvalidInput("too many devices".into()));
        }
        user.device_ids.push(device.to_string());
        if !self.occupancy.replace(&user).await? {
            return Err(EngineError::not_found("user", user.id));
        }
        Ok(user)
    }

    /// Bind a new sensor to `space`. The returned secret is the sensor's credential.
    pub async fn register_sensor(
        &self,
        address: PhysicalAddress,
        space: ObjectId,
    ) -> Result<Sensor, EngineError> {
        let target = self.require_space(space).await?;
        if target.deleted {
            return Err(EngineError::InvalidInput(format!("space {space} is deleted")));
        }
        let sensor = Sensor {
            id: ObjectId::new(),
            address,
            secret: generate_secret(),
            space,
        };
        // One sensor per space and per address, enforced by unique indexes.
        self.occupancy.insert(&sensor).await?;
        info!(sensor = %sensor.id, %address, %space, "sensor registered");
        Ok(sensor)
    }

    pub async fn authorize_sensor(
        &self,
        address: PhysicalAddress,
        secret: &str,
    ) -> Result<Sensor, EngineError> {
        let sensor = self
            .occupancy
            .sensor_by_address(address)
            .await?
            .ok_or_else(|| EngineError::not_found("sensor", address))?;
        if sensor.secret != secret {
            return Err(EngineError::Forbidden(format!("bad secret for sensor {address}")));
        }
        Ok(sensor)
    }

    pub async fn reservations_of(&self, user: ObjectId) -> Result<Vec<Reservation>, EngineError> {
        Ok(self.occupancy.reservations_of_user(user).await?)
    }

    pub async fn parking_of(&self, user: ObjectId) -> Result<Vec<ParkingSession>, EngineError> {
        Ok(self.occupancy.parking_of_user(user).await?)
    }

    pub async fn records_of(&self, user: ObjectId) -> Result<Vec<Record>, EngineError> {
        Ok(self.occupancy.records_of_user(user).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_is_sixteen_hex() {
        let secret = generate_secret();
        assert_eq!(secret.len(), 16);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(secret, generate_secret());
    }
}
