use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait TemperatureSensor: Send + Sync {
    fn key(&self) -> String;
    async fn read_temperature(&self) -> Result<f64>;
}
