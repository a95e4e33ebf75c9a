// 模块划分：协议与串口、传感器滤波、标定、控制环、平台抽象与 Web 接口
pub mod components;
pub mod control;
pub mod failsafe;
pub mod imu_calibration;
pub mod lpf;
pub mod madgwick;
pub mod model;
pub mod pid;
pub mod pipeline;
pub mod platform;
pub mod proto;
pub mod rc_pulse;
pub mod serial;
pub mod serial_io;
pub mod sim;
pub mod stabilization;
pub mod storage;
pub mod telemetry;
pub mod web;
