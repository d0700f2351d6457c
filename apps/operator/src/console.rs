//! Interactive prompt over one session controller.

use std::{future::Future, sync::Arc};

use anyhow::{Context, Result};
use client_core::{OperatorHandle, SessionController, SessionError};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt},
    task::JoinHandle,
};

use crate::{
    commands::{parse_line, OperatorCommand, HELP},
    render,
};

pub struct Console {
    handle: Arc<SessionController>,
    operator: String,
    telemetry_task: Option<JoinHandle<()>>,
    /// Connect attempt still running, kept so teardown can wait for it.
    connecting: Option<JoinHandle<Result<(), SessionError>>>,
}

impl Console {
    pub fn new(handle: Arc<SessionController>, operator: String) -> Self {
        Self {
            handle,
            operator,
            telemetry_task: None,
            connecting: None,
        }
    }

    /// Runs `first`, then every command read from `input`, until EOF, `quit`,
    /// a read error or `interrupt`. The session is always torn down before
    /// returning.
    pub async fn serve<R, I>(
        mut self,
        first: Option<OperatorCommand>,
        input: R,
        interrupt: I,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        I: Future<Output = ()>,
    {
        let outcome = self.read_commands(first, input, interrupt).await;
        self.close().await;
        outcome
    }

    async fn read_commands<R, I>(
        &mut self,
        first: Option<OperatorCommand>,
        input: R,
        interrupt: I,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        I: Future<Output = ()>,
    {
        tokio::pin!(interrupt);
        let mut lines = input.lines();
        let mut next = first;
        loop {
            let command = match next.take() {
                Some(command) => command,
                None => {
                    let line = tokio::select! {
                        line = lines.next_line() => line.context("failed to read stdin")?,
                        _ = &mut interrupt => return Ok(()),
                    };
                    let Some(line) = line else {
                        return Ok(());
                    };
                    match parse_line(&line) {
                        Ok(Some(OperatorCommand::Quit)) => return Ok(()),
                        Ok(Some(command)) => command,
                        Ok(None) => continue,
                        Err(message) => {
                            println!("{message}");
                            continue;
                        }
                    }
                }
            };

            tokio::select! {
                _ = self.run(command) => {}
                _ = &mut interrupt => return Ok(()),
            }
        }
    }

    async fn close(&mut self) {
        self.handle.shutdown().await;
        if let Some(attempt) = self.connecting.take() {
            // Cancelled by the shutdown above, it releases what it claimed.
            let _ = attempt.await;
            // An attempt that had not started yet got through; end it too.
            self.handle.shutdown().await;
        }
        self.stop_telemetry();
    }

    pub async fn run(&mut self, command: OperatorCommand) {
        let controller = Arc::clone(&self.handle);
        let handle: &dyn OperatorHandle = &controller;
        let outcome = match command {
            OperatorCommand::Devices => handle.list_devices().await.map(|devices| {
                for device in devices {
                    println!("  {device}");
                }
            }),
            OperatorCommand::Connect { device, operator } => {
                let label = operator.unwrap_or_else(|| self.operator.clone());
                match self.connect(device, label.clone()).await {
                    Ok(()) => {
                        self.operator = label;
                        self.watch_telemetry();
                        Ok(())
                    }
                    Err(error) => Err(error),
                }
            }
            OperatorCommand::Hold(command) => handle.hold_input(command).await,
            OperatorCommand::Release(command) => handle.release_input(command).await,
            OperatorCommand::Drive { command, duration } => {
                match handle.hold_input(command).await {
                    Ok(()) => {
                        tokio::time::sleep(duration).await;
                        handle.release_input(command).await
                    }
                    Err(error) => {
                        // The input is held even when its first write failed.
                        let _ = handle.release_input(command).await;
                        Err(error)
                    }
                }
            }
            OperatorCommand::Speed(direction) => handle
                .adjust_speed(direction)
                .await
                .map(|speed| println!("speed {speed}")),
            OperatorCommand::Test => handle.send_test_command().await,
            OperatorCommand::TestSpeed => handle
                .send_test_speed()
                .await
                .map(|speed| println!("speed {speed}")),
            OperatorCommand::Status => {
                self.print_status();
                Ok(())
            }
            OperatorCommand::Disconnect => {
                let result = handle.disconnect().await;
                self.stop_telemetry();
                result
            }
            OperatorCommand::Help => {
                println!("{HELP}");
                Ok(())
            }
            OperatorCommand::Quit => Ok(()),
        };

        if let Err(error) = outcome {
            println!("error: {error}");
        }
    }

    /// The attempt runs on its own task so an interrupted prompt cannot drop
    /// it halfway through claiming the device.
    async fn connect(&mut self, device: String, label: String) -> Result<(), SessionError> {
        let controller = Arc::clone(&self.handle);
        let attempt = self.connecting.insert(tokio::spawn(async move {
            controller.connect(&device, &label).await.map(|_| ())
        }));
        let result = attempt.await.unwrap_or(Err(SessionError::Cancelled));
        self.connecting = None;
        result
    }

    fn print_status(&self) {
        println!("session: {}", render::describe_state(&self.handle.state()));
        if let Some(snapshot) = self.handle.session_snapshot() {
            println!("  {}", render::describe_session(&snapshot));
        }
        if let Some(telemetry) = self.handle.telemetry() {
            println!("  {}", render::describe_telemetry(&telemetry.borrow()));
        }
    }

    fn watch_telemetry(&mut self) {
        self.stop_telemetry();
        let Some(mut telemetry) = OperatorHandle::telemetry(&self.handle) else {
            return;
        };
        self.telemetry_task = Some(tokio::spawn(async move {
            while telemetry.changed().await.is_ok() {
                let line = render::describe_telemetry(&telemetry.borrow_and_update());
                println!("~ {line}");
            }
        }));
    }

    fn stop_telemetry(&mut self) {
        if let Some(task) = self.telemetry_task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/console_tests.rs"]
mod tests;
