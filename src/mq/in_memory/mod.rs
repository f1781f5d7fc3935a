//! 프로세스 내부 드라이버
//!
//! 외부 서버 없이 브로커 동작을 실행하기 위한 드라이버 구현입니다.
//! 장애 주입 메서드로 연결 끊김, 서버 다운 등을 재현할 수 있습니다.

mod amqp;
mod pubsub;
mod stream;

pub use amqp::MemoryAmqpTransport;
pub use pubsub::MemoryPubSubBackend;
pub use stream::MemoryStreamBackend;
