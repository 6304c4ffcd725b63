#[cfg(windows)]
mod window {
    use anyhow::Result;
    use gisandbox::SandboxConfig;
    use gisandbox::dx12::Renderer;
    use gisandbox::scene::{InputState, Key as CameraKey};
    use glam::Vec2;
    use raw_window_handle::{HasWindowHandle, RawWindowHandle};
    use windows::Win32::Foundation::HWND;
    use winit::application::ApplicationHandler;
    use winit::dpi::PhysicalSize;
    use winit::event::{DeviceEvent, DeviceId, ElementState, KeyEvent, MouseButton, MouseScrollDelta, WindowEvent};
    use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
    use winit::keyboard::{Key, NamedKey};
    use winit::window::{Window, WindowId};

    struct App {
        config: SandboxConfig,
        window: Option<Window>,
        renderer: Option<Renderer>,
        input: InputState,
        error: Option<anyhow::Error>,
    }

    impl App {
        fn new(config: SandboxConfig) -> Self {
            Self {
                config,
                window: None,
                renderer: None,
                input: InputState::default(),
                error: None,
            }
        }

        fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
            log::error!("{error:#}");
            self.error = Some(error);
            event_loop.exit();
        }

        fn create(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
            let attributes = Window::default_attributes()
                .with_title(self.config.title.clone())
                .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));
            let window = event_loop.create_window(attributes)?;
            let size = window.inner_size();

            let hwnd = match window.window_handle()?.as_raw() {
                RawWindowHandle::Win32(handle) => HWND(handle.hwnd.get() as *mut _),
                other => anyhow::bail!("unsupported window handle {other:?}"),
            };

            self.renderer = Some(Renderer::new(hwnd, size.width, size.height, &self.config)?);
            self.window = Some(window);
            Ok(())
        }

        fn on_key(&mut self, event_loop: &ActiveEventLoop, key: &Key, pressed: bool) {
            let camera_key = match key {
                Key::Named(NamedKey::Escape) if pressed => {
                    event_loop.exit();
                    return;
                }
                Key::Named(NamedKey::F1) if pressed => {
                    if let Some(renderer) = &mut self.renderer {
                        let overlay = renderer.overlay_mut();
                        overlay.visible = !overlay.visible;
                    }
                    return;
                }
                Key::Named(NamedKey::Shift) => CameraKey::Shift,
                Key::Character(c) => match c.to_ascii_lowercase().as_str() {
                    "w" => CameraKey::W,
                    "a" => CameraKey::A,
                    "s" => CameraKey::S,
                    "d" => CameraKey::D,
                    "q" => CameraKey::Q,
                    "e" => CameraKey::E,
                    _ => return,
                },
                _ => return,
            };
            if pressed {
                self.input.press(camera_key);
            } else {
                self.input.release(camera_key);
            }
        }
    }

    impl ApplicationHandler for App {
        fn resumed(&mut self, event_loop: &ActiveEventLoop) {
            if self.window.is_some() {
                return;
            }
            if let Err(e) = self.create(event_loop) {
                self.fail(event_loop, e.context("failed to initialize the renderer"));
            }
        }

        fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
            match event {
                WindowEvent::CloseRequested => event_loop.exit(),
                WindowEvent::Resized(size) => {
                    if let Some(renderer) = &mut self.renderer {
                        renderer.on_window_size_changed(size.width, size.height);
                    }
                }
                WindowEvent::CursorMoved { position, .. } => {
                    self.input.cursor = Vec2::new(position.x as f32, position.y as f32);
                    if let Some(renderer) = &mut self.renderer {
                        renderer
                            .overlay_mut()
                            .on_mouse_move(position.x as f32, position.y as f32);
                    }
                }
                WindowEvent::MouseInput { state, button, .. } => {
                    let pressed = state == ElementState::Pressed;
                    let egui_button = match button {
                        MouseButton::Left => {
                            self.input.left_button = pressed;
                            egui::PointerButton::Primary
                        }
                        MouseButton::Right => {
                            self.input.right_button = pressed;
                            egui::PointerButton::Secondary
                        }
                        MouseButton::Middle => egui::PointerButton::Middle,
                        _ => return,
                    };
                    if let Some(renderer) = &mut self.renderer {
                        renderer.overlay_mut().on_mouse_button(egui_button, pressed);
                    }
                }
                WindowEvent::MouseWheel { delta, .. } => {
                    let (dx, dy) = match delta {
                        MouseScrollDelta::LineDelta(x, y) => (x * 20.0, y * 20.0),
                        MouseScrollDelta::PixelDelta(pos) => (pos.x as f32, pos.y as f32),
                    };
                    self.input.scroll += dy;
                    if let Some(renderer) = &mut self.renderer {
                        renderer.overlay_mut().on_mouse_wheel(dx, dy);
                    }
                }
                WindowEvent::KeyboardInput {
                    event: KeyEvent { logical_key, state, .. },
                    ..
                } => self.on_key(event_loop, &logical_key, state == ElementState::Pressed),
                WindowEvent::RedrawRequested => {
                    let Some(renderer) = &mut self.renderer else {
                        return;
                    };
                    if let Err(e) = renderer.run_frame(&self.input) {
                        self.fail(event_loop, anyhow::Error::new(e).context("frame failed"));
                        return;
                    }
                    self.input.end_frame();
                    if let Some(window) = &self.window {
                        window.request_redraw();
                    }
                }
                _ => {}
            }
        }

        fn device_event(&mut self, _event_loop: &ActiveEventLoop, _id: DeviceId, event: DeviceEvent) {
            if let DeviceEvent::MouseMotion { delta } = event {
                self.input.mouse_delta += Vec2::new(delta.0 as f32, delta.1 as f32);
            }
        }

        fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
            if let Some(window) = &self.window {
                window.request_redraw();
            }
        }

        fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
            // Dropping the renderer waits for the GPU before the window goes.
            self.renderer = None;
        }
    }

    pub fn run() -> Result<()> {
        let config = SandboxConfig::from_env()?;
        log::info!(
            "starting {}x{} with {} back buffers, gi {:?}",
            config.width,
            config.height,
            config.back_buffer_count,
            config.gi
        );

        let event_loop = EventLoop::new()?;
        event_loop.set_control_flow(ControlFlow::Poll);

        let mut app = App::new(config);
        event_loop.run_app(&mut app)?;
        match app.error.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

fn main() -> anyhow::Result<()> {
    gisandbox::logging::init_logging(gisandbox::logging::LoggingConfig::default());

    #[cfg(windows)]
    {
        window::run()
    }
    #[cfg(not(windows))]
    {
        log::error!("gisandbox renders through Direct3D 12 and only runs on Windows");
        std::process::exit(1)
    }
}
