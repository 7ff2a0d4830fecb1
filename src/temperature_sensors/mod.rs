pub mod hwmon_temp;
